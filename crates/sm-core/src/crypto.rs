//! Digest helpers shared by credential fingerprints and cache keys.

use ring::digest::{Context, SHA256};

/// SHA-256 over `parts`, each length-prefixed so `["ab","c"]` and
/// `["a","bc"]` hash differently. Returns lowercase hex.
pub fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut ctx = Context::new(&SHA256);
    for part in parts {
        ctx.update(&(part.len() as u64).to_be_bytes());
        ctx.update(part);
    }
    to_hex(ctx.finish().as_ref())
}

fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
