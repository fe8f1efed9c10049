//! Cache keys for AI requests.

use std::fmt;

use serde::Serialize;
use sm_core::crypto::sha256_hex;

/// Hex SHA-256 identifying one logical AI request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trim and collapse whitespace runs so trivially different spellings of
/// the same prompt share a key. Case is preserved.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Everything that can change the answer to a request.
#[derive(Debug, Clone, Default)]
pub struct FingerprintInput<'a> {
    pub provider: &'a str,
    pub model: &'a str,
    pub prompt: &'a str,
    pub system_prompt: Option<&'a str>,
    /// Session context line, when the request names a live session.
    pub context: Option<&'a str>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Principal the entry is private to; `None` shares it globally.
    pub scope: Option<&'a str>,
}

impl FingerprintInput<'_> {
    pub fn fingerprint(&self) -> Fingerprint {
        let prompt = normalize_prompt(self.prompt);
        let temperature = format!("{:.3}", self.temperature);
        let max_tokens = self.max_tokens.to_string();
        let parts: [&[u8]; 8] = [
            self.provider.as_bytes(),
            self.model.as_bytes(),
            prompt.as_bytes(),
            self.system_prompt.unwrap_or_default().as_bytes(),
            self.context.unwrap_or_default().as_bytes(),
            temperature.as_bytes(),
            max_tokens.as_bytes(),
            self.scope.unwrap_or_default().as_bytes(),
        ];
        Fingerprint(sha256_hex(&parts))
    }
}
