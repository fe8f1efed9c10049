use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sm_intelligence::cache::{CacheSettings, LookupSource, ResponseCache};
use sm_intelligence::fingerprint::{Fingerprint, FingerprintInput};

fn key(prompt: &str) -> Fingerprint {
    FingerprintInput {
        provider: "anthropic",
        model: "m",
        prompt,
        ..Default::default()
    }
    .fingerprint()
}

fn cache(capacity: usize, ttl: Duration) -> ResponseCache<String, String> {
    ResponseCache::new(CacheSettings::new(capacity, ttl))
}

#[tokio::test]
async fn concurrent_callers_share_one_compute() {
    let cache = cache(16, Duration::from_secs(60));
    let calls = AtomicUsize::new(0);
    let counter = &calls;
    let k = key("disk usage?");

    let compute = move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, String>("df -h".to_string())
    };
    let (a, b) = tokio::join!(cache.get_or_compute(&k, compute), cache.get_or_compute(&k, compute));

    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.value, "df -h");
    assert_eq!(b.value, "df -h");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let mut sources = [a.source, b.source];
    sources.sort_by_key(|s| *s as u8);
    assert_eq!(sources, [LookupSource::Coalesced, LookupSource::Computed]);

    let stats = cache.stats();
    assert_eq!(stats.coalesced, 1);
    assert_eq!(stats.inflight, 0);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn hit_after_compute() {
    let cache = cache(16, Duration::from_secs(60));
    let k = key("uptime?");

    let first = cache
        .get_or_compute(&k, || async { Ok::<_, String>("uptime".to_string()) })
        .await
        .unwrap();
    let second = cache
        .get_or_compute(&k, || async { Ok::<_, String>("never".to_string()) })
        .await
        .unwrap();

    assert_eq!(first.source, LookupSource::Computed);
    assert_eq!(second.source, LookupSource::Hit);
    assert_eq!(second.value, "uptime");
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn expired_entry_is_a_miss() {
    let cache = cache(16, Duration::from_secs(10));
    let k = key("who is logged in?");
    cache.insert(k.clone(), "w".to_string());

    tokio::time::advance(Duration::from_secs(9)).await;
    assert_eq!(cache.get(&k).as_deref(), Some("w"));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(cache.get(&k), None);

    let recomputed = cache
        .get_or_compute(&k, || async { Ok::<_, String>("who".to_string()) })
        .await
        .unwrap();
    assert_eq!(recomputed.source, LookupSource::Computed);
    assert_eq!(cache.stats().expirations, 1);
}

#[tokio::test]
async fn failure_is_not_cached() {
    let cache = cache(16, Duration::from_secs(60));
    let calls = AtomicUsize::new(0);
    let counter = &calls;
    let k = key("flaky");

    let err = cache
        .get_or_compute(&k, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>("upstream 503".to_string())
        })
        .await
        .unwrap_err();
    assert_eq!(err, "upstream 503");
    assert!(cache.is_empty());

    let ok = cache
        .get_or_compute(&k, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>("fine".to_string())
        })
        .await
        .unwrap();
    assert_eq!(ok.value, "fine");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn waiters_see_the_leaders_failure() {
    let cache = cache(16, Duration::from_secs(60));
    let calls = AtomicUsize::new(0);
    let counter = &calls;
    let k = key("broken");

    let compute = move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        Err::<String, _>("boom".to_string())
    };
    let (a, b) = tokio::join!(cache.get_or_compute(&k, compute), cache.get_or_compute(&k, compute));

    assert_eq!(a.unwrap_err(), "boom");
    assert_eq!(b.unwrap_err(), "boom");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().inflight, 0);
}

#[tokio::test]
async fn least_recently_used_entry_is_evicted() {
    let cache = cache(2, Duration::from_secs(60));
    let (a, b, c) = (key("a"), key("b"), key("c"));

    cache.insert(a.clone(), "A".into());
    cache.insert(b.clone(), "B".into());
    assert!(cache.get(&a).is_some());
    cache.insert(c.clone(), "C".into());

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get(&b), None);
    assert_eq!(cache.get(&a).as_deref(), Some("A"));
    assert_eq!(cache.get(&c).as_deref(), Some("C"));
    assert_eq!(cache.stats().evictions, 1);
}

#[tokio::test]
async fn large_cache_holds_everything_below_capacity() {
    let cache = cache(1024, Duration::from_secs(600));
    let keys: Vec<Fingerprint> = (0..1024).map(|i| key(&format!("question {i}"))).collect();

    for k in &keys[..1000] {
        cache.insert(k.clone(), "answer".into());
    }
    assert_eq!(cache.len(), 1000);
    assert_eq!(cache.stats().evictions, 0);

    for k in &keys[1000..] {
        cache.insert(k.clone(), "answer".into());
    }
    assert_eq!(cache.len(), 1024);
    assert_eq!(cache.stats().evictions, 0);

    // The first insert is the least recently used across the whole cache.
    cache.insert(key("one more"), "answer".into());
    assert_eq!(cache.len(), 1024);
    assert_eq!(cache.stats().evictions, 1);
    assert_eq!(cache.get(&keys[0]), None);
    assert!(cache.get(&keys[1]).is_some());
}

#[tokio::test]
async fn cancelled_leader_hands_over_to_waiter() {
    let cache = Arc::new(cache(16, Duration::from_secs(60)));
    let k = key("slow");

    let leader = {
        let cache = cache.clone();
        let k = k.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute(&k, || std::future::pending::<Result<String, String>>())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.inflight(), 1);

    let waiter = {
        let cache = cache.clone();
        let k = k.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute(&k, || async { Ok::<_, String>("second".to_string()) })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    leader.abort();

    let got = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter must not hang")
        .unwrap()
        .unwrap();
    assert_eq!(got.value, "second");
    assert_eq!(got.source, LookupSource::Computed);
    assert_eq!(cache.inflight(), 0);
}

#[tokio::test]
async fn purge_expired_drops_stale_entries() {
    let cache = cache(16, Duration::from_millis(20));
    cache.insert(key("x"), "x".into());
    cache.insert(key("y"), "y".into());
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(cache.purge_expired(), 2);
    assert!(cache.is_empty());
}
