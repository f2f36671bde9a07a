//! SRP-6a primitives — group parameters, padding, and hash helpers.
//!
//! The daemon authenticates with SRP-6a (RFC 5054 message flow) over a
//! fixed 2048-bit safe-prime group with SHA-256. All byte-string
//! concatenations that feed a hash use fixed-width left-zero padding to
//! the byte length of N, so client and server agree bit-for-bit.

use num_bigint::BigUint;
use num_traits::Zero;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

pub mod client;
pub mod server;
pub mod store;

/// 2048-bit MODP group (RFC 3526, group 14). N is a safe prime, g = 2.
const GROUP_N_HEX: &[u8] = b"\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// The shared SRP group, parsed once.
pub static GROUP: Lazy<SrpGroup> = Lazy::new(|| SrpGroup {
    n: BigUint::parse_bytes(GROUP_N_HEX, 16).expect("group modulus is valid hex"),
    g: BigUint::from(2u32),
});

/// Multiplier k = H(N || PAD(g)), computed once.
pub static MULTIPLIER_K: Lazy<BigUint> = Lazy::new(|| GROUP.compute_k());

/// Group used for SRP computations.
#[derive(Debug, Clone)]
pub struct SrpGroup {
    /// A large safe prime (N = 2q+1, q prime).
    pub n: BigUint,
    /// A generator modulo N.
    pub g: BigUint,
}

impl SrpGroup {
    /// Byte length of N; the fixed width every padded value is left-zero
    /// extended to.
    pub fn len(&self) -> usize {
        (self.n.bits() as usize + 7) / 8
    }

    /// g^x mod N.
    pub fn powm(&self, x: &BigUint) -> BigUint {
        self.g.modpow(x, &self.n)
    }

    /// Left-zero pad a group element to the byte length of N.
    pub fn pad(&self, v: &BigUint) -> Vec<u8> {
        pad_to(&v.to_bytes_be(), self.len())
    }

    fn compute_k(&self) -> BigUint {
        let n = self.n.to_bytes_be();
        let padded_g = pad_to(&self.g.to_bytes_be(), self.len());
        let digest = Sha256::new().chain_update(&n).chain_update(&padded_g).finalize();
        BigUint::from_bytes_be(&digest)
    }
}

/// Left-zero pad `bytes` to `width`. Values already at or beyond the width
/// pass through unchanged.
pub fn pad_to(bytes: &[u8], width: usize) -> Vec<u8> {
    if bytes.len() >= width {
        return bytes.to_vec();
    }
    let mut out = vec![0u8; width - bytes.len()];
    out.extend_from_slice(bytes);
    out
}

/// SHA-256 over the concatenation of the given parts.
pub fn hash_parts(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

/// H(N) XOR H(g) — the leading term of the M1 proof.
pub fn hash_n_xor_hash_g(group: &SrpGroup) -> Vec<u8> {
    let hn = hash_parts(&[&group.n.to_bytes_be()]);
    let hg = hash_parts(&[&group.g.to_bytes_be()]);
    hn.iter().zip(hg.iter()).map(|(a, b)| a ^ b).collect()
}

/// u = H(PAD(A) || PAD(B)). Zero is rejected by the caller.
pub fn compute_u(group: &SrpGroup, a_pub: &BigUint, b_pub: &BigUint) -> BigUint {
    BigUint::from_bytes_be(&hash_parts(&[&group.pad(a_pub), &group.pad(b_pub)]))
}

/// x = H(salt || H(username || ':' || password)).
pub fn compute_x(username: &str, password: &[u8], salt: &[u8]) -> BigUint {
    let inner = hash_parts(&[username.as_bytes(), b":", password]);
    BigUint::from_bytes_be(&hash_parts(&[salt, &inner]))
}

/// v = g^x mod N.
pub fn compute_verifier(group: &SrpGroup, x: &BigUint) -> BigUint {
    group.powm(x)
}

/// A public value is rejected when it collapses to zero mod N.
pub fn is_zero_mod_n(group: &SrpGroup, v: &BigUint) -> bool {
    (v % &group.n).is_zero()
}
