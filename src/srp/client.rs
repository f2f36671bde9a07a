//! Client-side SRP-6a computations — the counterpart a provisioning
//! client runs. Also drives the server in the end-to-end tests.

use num_bigint::BigUint;
use rand::RngCore;
use zeroize::Zeroizing;

use super::server::{compute_m1, compute_m2};
use super::{compute_u, compute_x, hash_parts, GROUP, MULTIPLIER_K};

pub struct ClientSession {
    pub a_pub: BigUint,
    a_secret: BigUint,
}

pub struct ClientProof {
    pub m1: Vec<u8>,
    pub key: Vec<u8>,
    pub expected_m2: Vec<u8>,
}

impl ClientSession {
    /// Generate the client ephemeral pair (a, A = g^a).
    pub fn start() -> Self {
        let mut seed = Zeroizing::new(vec![0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let a_secret = BigUint::from_bytes_be(&seed);
        let a_pub = GROUP.powm(&a_secret);
        Self { a_pub, a_secret }
    }

    /// Complete the client side from the server's init response: derive
    /// the session key and produce M1 plus the M2 expected back.
    pub fn finish(
        &self,
        username: &str,
        password: &[u8],
        salt: &[u8],
        b_pub_bytes: &[u8],
    ) -> ClientProof {
        let b_pub = BigUint::from_bytes_be(b_pub_bytes);
        let u = compute_u(&GROUP, &self.a_pub, &b_pub);
        let x = compute_x(username, password, salt);

        // S = (B - k·g^x) ^ (a + u·x) mod N, wrapping when the subtraction
        // would underflow.
        let n = &GROUP.n;
        let interm = (&*MULTIPLIER_K * GROUP.powm(&x)) % n;
        let base = if b_pub > interm {
            (&b_pub - &interm) % n
        } else {
            (n + &b_pub - &interm) % n
        };
        let exp = &self.a_secret + &u * &x;
        let session = base.modpow(&exp, n);
        let key = hash_parts(&[&GROUP.pad(&session)]);

        let m1 = compute_m1(&GROUP, username, salt, &self.a_pub, &b_pub, &key);
        let expected_m2 = compute_m2(&GROUP, &self.a_pub, &m1, &key);
        ClientProof {
            m1,
            key,
            expected_m2,
        }
    }
}
