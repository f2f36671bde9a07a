//! Session token manager — HMAC-signed bearer tokens.
//!
//! Wire format: `base64url(token_id) . base64url(HMAC_SHA256(secret, token_id))`.
//! The HMAC secret is generated from the OS RNG at startup and lives only
//! as long as the process; restarting the daemon invalidates every
//! outstanding token, which is the right property for a one-shot service.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;
use zeroize::Zeroizing;

pub mod ratelimit;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

const TOKEN_ID_LEN: usize = 16; // 128 bits

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session token is malformed")]
    Malformed,
    #[error("session token is invalid")]
    Invalid,
    #[error("session has expired")]
    Expired,
}

/// Identity resolved from a valid token, injected into request context.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionIdentity {
    pub username: String,
}

struct SessionRecord {
    username: String,
    expires_at: Instant,
}

pub struct SessionManager {
    secret: Zeroizing<Vec<u8>>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    ttl: Duration,
}

impl SessionManager {
    /// Fresh manager with a process-lifetime random HMAC secret.
    pub fn new(ttl: Duration) -> Self {
        let mut secret = Zeroizing::new(vec![0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self {
            secret,
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Mint a token for `username` and register the session.
    pub fn mint(&self, username: &str) -> String {
        let mut token_id = [0u8; TOKEN_ID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut token_id);

        let tag = self.sign(&token_id);
        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(token_id),
            URL_SAFE_NO_PAD.encode(tag)
        );

        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(
            hex::encode(token_id),
            SessionRecord {
                username: username.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        token
    }

    /// Validate a bearer token: structural checks, constant-time HMAC
    /// comparison, then session lookup and expiry.
    pub fn validate(&self, token: &str) -> Result<SessionIdentity, SessionError> {
        let mut parts = token.split('.');
        let (id_part, tag_part) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(tag), None) => (id, tag),
            _ => return Err(SessionError::Malformed),
        };

        let token_id = URL_SAFE_NO_PAD
            .decode(id_part)
            .map_err(|_| SessionError::Malformed)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_part)
            .map_err(|_| SessionError::Malformed)?;

        let expected = self.sign(&token_id);
        if !constant_time_eq(&expected, &tag) {
            return Err(SessionError::Invalid);
        }

        let mut sessions = self.sessions.lock().unwrap();
        let key = hex::encode(&token_id);
        let (expired, username) = {
            let record = sessions.get(&key).ok_or(SessionError::Invalid)?;
            (Instant::now() >= record.expires_at, record.username.clone())
        };
        if expired {
            sessions.remove(&key);
            return Err(SessionError::Expired);
        }
        Ok(SessionIdentity { username })
    }

    /// Remove expired sessions. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, record| record.expires_at > now);
        before - sessions.len()
    }

    /// Reaper period: at most TTL/10.
    pub fn reaper_period(&self) -> Duration {
        (self.ttl / 10).max(Duration::from_secs(1))
    }

    fn sign(&self, token_id: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(token_id);
        mac.finalize().into_bytes().to_vec()
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

/// Periodically purge expired sessions until shutdown fires.
pub async fn run_session_reaper(
    manager: std::sync::Arc<SessionManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(manager.reaper_period());
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let removed = manager.purge_expired();
                if removed > 0 {
                    debug!(removed, "Expired sessions reaped");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Compare two byte strings in constant time. Both inputs are run through
/// HMAC with a fixed key and the fixed-length outputs compared; equal
/// inputs produce equal MACs, and the comparison cost is independent of
/// where the inputs differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let key = b"boardingpass-constant-time-comparison-key";
    let mut mac_a = HmacSha256::new_from_slice(key).unwrap();
    let mut mac_b = HmacSha256::new_from_slice(key).unwrap();
    mac_a.update(a);
    mac_b.update(b);
    mac_a.finalize().into_bytes() == mac_b.finalize().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_validate_round_trip() {
        let manager = SessionManager::new(DEFAULT_SESSION_TTL);
        let token = manager.mint("admin");
        let identity = manager.validate(&token).unwrap();
        assert_eq!(identity.username, "admin");
    }

    #[test]
    fn test_token_shape() {
        let manager = SessionManager::new(DEFAULT_SESSION_TTL);
        let token = manager.mint("admin");
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(
            URL_SAFE_NO_PAD.decode(parts[0]).unwrap().len(),
            TOKEN_ID_LEN
        );
        assert_eq!(URL_SAFE_NO_PAD.decode(parts[1]).unwrap().len(), 32);
    }

    #[test]
    fn test_expired_session() {
        let manager = SessionManager::new(Duration::from_millis(0));
        let token = manager.mint("admin");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.validate(&token), Err(SessionError::Expired));
        // The expired record is gone; a second attempt is plain invalid.
        assert_eq!(manager.validate(&token), Err(SessionError::Invalid));
    }

    #[test]
    fn test_single_bit_corruption_rejected() {
        let manager = SessionManager::new(DEFAULT_SESSION_TTL);
        let token = manager.mint("admin");
        let bytes = token.as_bytes();
        for i in 0..bytes.len() {
            if bytes[i] == b'.' {
                continue;
            }
            let mut corrupted = bytes.to_vec();
            corrupted[i] ^= 0x01;
            let corrupted = String::from_utf8_lossy(&corrupted).into_owned();
            assert!(
                manager.validate(&corrupted).is_err(),
                "bit flip at {} accepted",
                i
            );
        }
    }

    #[test]
    fn test_malformed_tokens() {
        let manager = SessionManager::new(DEFAULT_SESSION_TTL);
        assert_eq!(manager.validate(""), Err(SessionError::Malformed));
        assert_eq!(manager.validate("abc"), Err(SessionError::Malformed));
        assert_eq!(manager.validate("a.b.c"), Err(SessionError::Malformed));
        assert_eq!(manager.validate("!!!.!!!"), Err(SessionError::Malformed));
    }

    #[test]
    fn test_foreign_token_rejected() {
        // A token minted under a different process secret must not validate.
        let manager_a = SessionManager::new(DEFAULT_SESSION_TTL);
        let manager_b = SessionManager::new(DEFAULT_SESSION_TTL);
        let token = manager_a.mint("admin");
        assert_eq!(manager_b.validate(&token), Err(SessionError::Invalid));
    }

    #[test]
    fn test_purge_expired() {
        let manager = SessionManager::new(Duration::from_millis(0));
        manager.mint("admin");
        manager.mint("admin");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.purge_expired(), 2);
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn test_reaper_period_bounded_by_ttl() {
        let manager = SessionManager::new(Duration::from_secs(600));
        assert!(manager.reaper_period() <= Duration::from_secs(60));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc123", b"abc123"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"abc123", b"abc124"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
