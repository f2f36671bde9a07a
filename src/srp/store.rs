//! Pending-handshake store — short-lived server state between SRP init
//! and verify.
//!
//! Retrieval is destructive: `take` removes the entry inside a single
//! critical section, so two concurrent verify attempts for the same
//! handshake can never both observe the server secret `b`. Entries also
//! expire after a TTL and are collected by a background reaper.

use num_bigint::BigUint;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;
use zeroize::Zeroizing;

pub const DEFAULT_HANDSHAKE_TTL: Duration = Duration::from_secs(300);

/// Server-side state for one in-flight handshake. The secret ephemeral is
/// kept as big-endian bytes inside `Zeroizing` so it is wiped when the
/// entry is dropped, on both the success and failure paths.
pub struct PendingHandshake {
    pub username: String,
    pub salt: Vec<u8>,
    pub a_pub: BigUint,
    pub b_pub: BigUint,
    pub b_secret: Zeroizing<Vec<u8>>,
    pub u: BigUint,
    pub verifier: BigUint,
}

struct StoredEntry {
    handshake: PendingHandshake,
    created: Instant,
}

pub struct HandshakeStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
    ttl: Duration,
}

impl HandshakeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Store a pending handshake under a fresh unguessable id (128 bits
    /// from the OS RNG) and return the id.
    pub fn insert(&self, handshake: PendingHandshake) -> String {
        let mut entries = self.entries.lock().unwrap();
        loop {
            let id = new_handshake_id();
            if entries.contains_key(&id) {
                continue;
            }
            entries.insert(
                id.clone(),
                StoredEntry {
                    handshake,
                    created: Instant::now(),
                },
            );
            return id;
        }
    }

    /// Atomically remove and return the handshake for `id`. Expired entries
    /// are treated as absent. At most one caller can ever receive a given
    /// entry.
    pub fn take(&self, id: &str) -> Option<PendingHandshake> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.remove(id)?;
        if entry.created.elapsed() > self.ttl {
            return None;
        }
        Some(entry.handshake)
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.created.elapsed() <= self.ttl);
        before - entries.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Periodically purge expired handshakes until shutdown fires.
pub async fn run_reaper(store: std::sync::Arc<HandshakeStore>, mut shutdown: watch::Receiver<bool>) {
    let period = store.ttl / 10;
    let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let removed = store.purge_expired();
                if removed > 0 {
                    debug!(removed, "Expired SRP handshakes reaped");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

fn new_handshake_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn dummy_handshake() -> PendingHandshake {
        PendingHandshake {
            username: "admin".into(),
            salt: vec![1, 2, 3],
            a_pub: BigUint::from(11u32),
            b_pub: BigUint::from(22u32),
            b_secret: Zeroizing::new(vec![9, 9, 9]),
            u: BigUint::from(33u32),
            verifier: BigUint::from(44u32),
        }
    }

    #[test]
    fn test_take_is_one_time() {
        let store = HandshakeStore::new(DEFAULT_HANDSHAKE_TTL);
        let id = store.insert(dummy_handshake());
        assert!(store.take(&id).is_some());
        assert!(store.take(&id).is_none());
    }

    #[test]
    fn test_ids_are_unique_and_long() {
        let store = HandshakeStore::new(DEFAULT_HANDSHAKE_TTL);
        let a = store.insert(dummy_handshake());
        let b = store.insert(dummy_handshake());
        assert_ne!(a, b);
        assert_eq!(a.len(), 32); // 128 bits, hex
    }

    #[test]
    fn test_expired_entry_is_absent() {
        let store = HandshakeStore::new(Duration::from_millis(0));
        let id = store.insert(dummy_handshake());
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.take(&id).is_none());
    }

    #[test]
    fn test_purge_expired() {
        let store = HandshakeStore::new(Duration::from_millis(0));
        store.insert(dummy_handshake());
        store.insert(dummy_handshake());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_take_single_winner() {
        let store = Arc::new(HandshakeStore::new(DEFAULT_HANDSHAKE_TTL));
        let id = store.insert(dummy_handshake());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move { store.take(&id).is_some() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
