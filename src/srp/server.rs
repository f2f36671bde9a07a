//! SRP-6a server — verifier derivation and the two-message handshake.
//!
//! The verifier is recomputed on every handshake from the configured
//! username, salt, and the password-generator output; it is never
//! persisted. Handshake state between init and verify lives in the
//! one-time-take store, so a server ephemeral `b` can never be replayed
//! against a second proof attempt.

use num_bigint::BigUint;
use num_traits::Zero;
use rand::RngCore;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::store::{HandshakeStore, PendingHandshake};
use super::{
    compute_u, compute_verifier, compute_x, hash_n_xor_hash_g, hash_parts, is_zero_mod_n,
    SrpGroup, GROUP, MULTIPLIER_K,
};
use crate::auth::constant_time_eq;
use crate::password::{GeneratorError, PasswordGenerator};

/// Every variant maps to a plain *authentication failed* on the wire; the
/// distinction exists only for internal logging.
#[derive(Debug, Error)]
pub enum SrpError {
    #[error("unknown username")]
    UnknownUser,
    #[error("client public value is zero mod N")]
    InvalidPublicValue,
    #[error("scrambling parameter collapsed to zero")]
    DegenerateParameters,
    #[error("unknown or expired handshake")]
    UnknownHandshake,
    #[error("client proof mismatch")]
    ProofMismatch,
    #[error(transparent)]
    Generator(#[from] GeneratorError),
}

pub struct InitOutcome {
    pub handshake_id: String,
    pub salt: Vec<u8>,
    pub b_pub: Vec<u8>,
}

pub struct VerifyOutcome {
    pub m2: Vec<u8>,
    pub username: String,
}

/// Process-wide SRP authenticator: one configured identity per device.
pub struct SrpServer {
    username: String,
    salt: Vec<u8>,
    generator: PasswordGenerator,
    store: Arc<HandshakeStore>,
}

impl SrpServer {
    pub fn new(
        username: String,
        salt: Vec<u8>,
        generator: PasswordGenerator,
        store: Arc<HandshakeStore>,
    ) -> Self {
        Self {
            username,
            salt,
            generator,
            store,
        }
    }

    pub fn handshake_store(&self) -> &Arc<HandshakeStore> {
        &self.store
    }

    /// Handshake message 1: check the username, derive the verifier, mint
    /// the server ephemeral, and park the state for the verify round.
    pub async fn init(&self, username: &str, a_pub_bytes: &[u8]) -> Result<InitOutcome, SrpError> {
        // Constant-time: a wrong username must cost the same as a right one.
        if !constant_time_eq(username.as_bytes(), self.username.as_bytes()) {
            return Err(SrpError::UnknownUser);
        }

        let a_pub = BigUint::from_bytes_be(a_pub_bytes);

        // The generator runs on every attempt, before A is inspected, so
        // a malicious A cannot be told apart from any other rejection by
        // response latency.
        let password = self.generator.generate().await?;
        let x = compute_x(&self.username, &password, &self.salt);
        let verifier = compute_verifier(&GROUP, &x);
        drop(password);

        if is_zero_mod_n(&GROUP, &a_pub) {
            warn!("SRP init rejected: A ≡ 0 mod N");
            return Err(SrpError::InvalidPublicValue);
        }

        // B = (k·v + g^b) mod N, regenerating until it does not collapse.
        let (b_secret, b_pub) = loop {
            let b_secret = random_ephemeral();
            let b = BigUint::from_bytes_be(&b_secret);
            let b_pub = (&*MULTIPLIER_K * &verifier + GROUP.powm(&b)) % &GROUP.n;
            if !b_pub.is_zero() {
                break (b_secret, b_pub);
            }
        };

        let u = compute_u(&GROUP, &a_pub, &b_pub);
        if u.is_zero() {
            return Err(SrpError::DegenerateParameters);
        }

        let handshake_id = self.store.insert(PendingHandshake {
            username: self.username.clone(),
            salt: self.salt.clone(),
            a_pub,
            b_pub: b_pub.clone(),
            b_secret,
            u,
            verifier,
        });

        info!(username = %self.username, "SRP handshake initiated");
        Ok(InitOutcome {
            handshake_id,
            salt: self.salt.clone(),
            b_pub: b_pub.to_bytes_be(),
        })
    }

    /// Handshake message 2: consume the pending state, check the client
    /// proof in constant time, and produce the server proof. The pending
    /// entry is gone after this call whether or not the proof matched.
    pub fn verify(&self, handshake_id: &str, m1: &[u8]) -> Result<VerifyOutcome, SrpError> {
        let pending = self
            .store
            .take(handshake_id)
            .ok_or(SrpError::UnknownHandshake)?;

        let b = BigUint::from_bytes_be(&pending.b_secret);
        // S = (A · v^u)^b mod N
        let base = (&pending.a_pub * pending.verifier.modpow(&pending.u, &GROUP.n)) % &GROUP.n;
        let session = base.modpow(&b, &GROUP.n);
        let key: Zeroizing<Vec<u8>> = Zeroizing::new(hash_parts(&[&GROUP.pad(&session)]));

        let expected = compute_m1(
            &GROUP,
            &pending.username,
            &pending.salt,
            &pending.a_pub,
            &pending.b_pub,
            &key,
        );

        if !constant_time_eq(&expected, m1) {
            return Err(SrpError::ProofMismatch);
        }

        let m2 = compute_m2(&GROUP, &pending.a_pub, m1, &key);
        info!(username = %pending.username, "SRP proof verified");
        Ok(VerifyOutcome {
            m2,
            username: pending.username,
        })
    }
}

/// M1 = H(H(N) XOR H(g) || H(I) || s || PAD(A) || PAD(B) || K).
pub(crate) fn compute_m1(
    group: &SrpGroup,
    username: &str,
    salt: &[u8],
    a_pub: &BigUint,
    b_pub: &BigUint,
    key: &[u8],
) -> Vec<u8> {
    let prefix = hash_n_xor_hash_g(group);
    let hashed_user = hash_parts(&[username.as_bytes()]);
    hash_parts(&[
        &prefix,
        &hashed_user,
        salt,
        &group.pad(a_pub),
        &group.pad(b_pub),
        key,
    ])
}

/// M2 = H(PAD(A) || M1 || K).
pub(crate) fn compute_m2(group: &SrpGroup, a_pub: &BigUint, m1: &[u8], key: &[u8]) -> Vec<u8> {
    hash_parts(&[&group.pad(a_pub), m1, key])
}

/// 256-bit server ephemeral from the OS RNG.
fn random_ephemeral() -> Zeroizing<Vec<u8>> {
    let mut bytes = Zeroizing::new(vec![0u8; 32]);
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srp::client::ClientSession;
    use crate::srp::store::DEFAULT_HANDSHAKE_TTL;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    const USERNAME: &str = "admin";
    const PASSWORD: &[u8] = b"test-password-12345";
    const SALT: &[u8] = b"server-salt-123456";

    fn test_generator(dir: &tempfile::TempDir, password: &str) -> PasswordGenerator {
        let path = dir.path().join("device-secret.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "printf '{}\\n'", password).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        PasswordGenerator::new(path, Duration::from_secs(5))
    }

    fn test_server(dir: &tempfile::TempDir, password: &str) -> SrpServer {
        SrpServer::new(
            USERNAME.into(),
            SALT.to_vec(),
            test_generator(dir, password),
            Arc::new(HandshakeStore::new(DEFAULT_HANDSHAKE_TTL)),
        )
    }

    #[tokio::test]
    async fn test_round_trip_derives_matching_keys() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir, "test-password-12345");

        let client = ClientSession::start();
        let init = server
            .init(USERNAME, &client.a_pub.to_bytes_be())
            .await
            .unwrap();
        assert_eq!(init.salt, SALT);

        let proof = client.finish(USERNAME, PASSWORD, &init.salt, &init.b_pub);
        let outcome = server.verify(&init.handshake_id, &proof.m1).unwrap();
        assert_eq!(outcome.m2, proof.expected_m2);
        assert_eq!(outcome.username, USERNAME);
    }

    #[tokio::test]
    async fn test_wrong_password_fails_and_consumes_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir, "test-password-12345");

        let client = ClientSession::start();
        let init = server
            .init(USERNAME, &client.a_pub.to_bytes_be())
            .await
            .unwrap();

        let proof = client.finish(USERNAME, b"wrongpassword", &init.salt, &init.b_pub);
        assert!(matches!(
            server.verify(&init.handshake_id, &proof.m1),
            Err(SrpError::ProofMismatch)
        ));

        // One-time use: the same id fails regardless of the proof.
        let good = client.finish(USERNAME, PASSWORD, &init.salt, &init.b_pub);
        assert!(matches!(
            server.verify(&init.handshake_id, &good.m1),
            Err(SrpError::UnknownHandshake)
        ));
    }

    #[tokio::test]
    async fn test_wrong_username_rejected_at_init() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir, "test-password-12345");
        let client = ClientSession::start();
        assert!(matches!(
            server.init("wronguser", &client.a_pub.to_bytes_be()).await,
            Err(SrpError::UnknownUser)
        ));
    }

    #[tokio::test]
    async fn test_zero_public_value_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir, "test-password-12345");
        assert!(matches!(
            server.init(USERNAME, &GROUP.n.to_bytes_be()).await,
            Err(SrpError::InvalidPublicValue)
        ));
        assert!(matches!(
            server.init(USERNAME, &[0u8]).await,
            Err(SrpError::InvalidPublicValue)
        ));
    }

    #[tokio::test]
    async fn test_tampered_proof_fails() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir, "test-password-12345");

        let client = ClientSession::start();
        let init = server
            .init(USERNAME, &client.a_pub.to_bytes_be())
            .await
            .unwrap();
        let mut proof = client.finish(USERNAME, PASSWORD, &init.salt, &init.b_pub);
        proof.m1[0] ^= 0x01;
        assert!(matches!(
            server.verify(&init.handshake_id, &proof.m1),
            Err(SrpError::ProofMismatch)
        ));
    }

    #[tokio::test]
    async fn test_altered_salt_breaks_proof() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir, "test-password-12345");

        let client = ClientSession::start();
        let init = server
            .init(USERNAME, &client.a_pub.to_bytes_be())
            .await
            .unwrap();
        let proof = client.finish(USERNAME, PASSWORD, b"some-other-salt", &init.b_pub);
        assert!(matches!(
            server.verify(&init.handshake_id, &proof.m1),
            Err(SrpError::ProofMismatch)
        ));
    }

    #[tokio::test]
    async fn test_generator_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\nexit 1").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let server = SrpServer::new(
            USERNAME.into(),
            SALT.to_vec(),
            PasswordGenerator::new(path, Duration::from_secs(5)),
            Arc::new(HandshakeStore::new(DEFAULT_HANDSHAKE_TTL)),
        );
        let client = ClientSession::start();
        assert!(matches!(
            server.init(USERNAME, &client.a_pub.to_bytes_be()).await,
            Err(SrpError::Generator(_))
        ));
    }
}
