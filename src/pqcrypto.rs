#![forbid(unsafe_code)]

//! Kyber-512 key material for channel establishment.
//!
//! Connecting a pid pair provisions both directions of the channel with one
//! 32-byte secret. The secret is derived from two KEM keypairs through a
//! domain-tagged SHAKE256 with the keypairs taken in canonical order, so the
//! derivation is symmetric in its arguments and both endpoints of a channel
//! reach the same bytes from the same pair of keypairs.

use pqcrypto_kyber::kyber512;
use pqcrypto_traits::kem::{PublicKey as KemPublicKey, SecretKey as KemSecretKey};
use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Shake256,
};
use zeroize::{Zeroize, Zeroizing};

/// Kyber-512 public key size in bytes.
pub const KEM_PUBLIC_KEY_SIZE: usize = 800;

/// Kyber-512 secret key size in bytes.
pub const KEM_SECRET_KEY_SIZE: usize = 1632;

/// Channel secret size: the AEAD key width.
pub const CHANNEL_SECRET_SIZE: usize = 32;

const SECRET_DOMAIN: &[u8] = b"LATTICE-CHANNEL-SECRET.v1";

/// KEM keypair used for channel-secret derivation.
///
/// The secret half is zeroized when the pair is dropped.
pub struct KeyPair {
    public: Vec<u8>,
    secret: Zeroizing<Vec<u8>>,
}

impl KeyPair {
    /// Public component (800 bytes for a well-formed pair).
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    fn well_formed(&self) -> bool {
        self.public.len() == KEM_PUBLIC_KEY_SIZE && self.secret.len() == KEM_SECRET_KEY_SIZE
    }

    #[cfg(any(test, feature = "preshared-kem"))]
    fn from_raw(public: Vec<u8>, secret: Vec<u8>) -> Self {
        Self {
            public,
            secret: Zeroizing::new(secret),
        }
    }
}

/// 32-byte channel secret, zeroized on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret([u8; CHANNEL_SECRET_SIZE]);

impl SharedSecret {
    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; CHANNEL_SECRET_SIZE] {
        &self.0
    }

    /// True for the all-zero sentinel returned on malformed input keys.
    /// Callers must refuse to key a channel with a null secret.
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Short hex fingerprint for log lines. Never the full secret.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

/// Generates a fresh Kyber-512 keypair from the system CSRNG.
pub fn generate_keypair() -> KeyPair {
    let (pk, sk) = kyber512::keypair();
    KeyPair {
        public: pk.as_bytes().to_vec(),
        secret: Zeroizing::new(sk.as_bytes().to_vec()),
    }
}

/// Derives the 32-byte channel secret from two keypairs.
///
/// Symmetric: `compute_shared_secret(a, b) == compute_shared_secret(b, a)`.
/// Keys whose components do not match the KEM's fixed sizes yield the
/// all-zero sentinel.
pub fn compute_shared_secret(local: &KeyPair, peer: &KeyPair) -> SharedSecret {
    if !local.well_formed() || !peer.well_formed() {
        return SharedSecret([0u8; CHANNEL_SECRET_SIZE]);
    }

    let (lo, hi) = if local.public <= peer.public {
        (local, peer)
    } else {
        (peer, local)
    };

    let mut h = Shake256::default();
    h.update(SECRET_DOMAIN);
    h.update(&lo.public);
    h.update(&hi.public);
    h.update(&lo.secret);
    h.update(&hi.secret);

    let mut out = [0u8; CHANNEL_SECRET_SIZE];
    h.finalize_xof().read(&mut out);
    SharedSecret(out)
}

/// Seam over keypair generation. [`KyberExchange`] is the production
/// implementation; `PresharedExchange` covers closed meshes and tests when
/// compiled in.
pub trait KeyExchange: Send + Sync {
    /// Produces the next keypair.
    fn generate_keypair(&self) -> KeyPair;

    /// Derives the channel secret for a pair of keypairs.
    fn channel_secret(&self, a: &KeyPair, b: &KeyPair) -> SharedSecret {
        compute_shared_secret(a, b)
    }
}

/// CSRNG-backed Kyber-512 generator.
pub struct KyberExchange;

impl KeyExchange for KyberExchange {
    fn generate_keypair(&self) -> KeyPair {
        generate_keypair()
    }
}

/// Deterministic keypair stream expanded from a pre-shared 32-byte seed.
///
/// Two ends built from the same seed emit identical keypair sequences, so
/// both arrive at the same channel secrets without a wire handshake (the
/// loopback `connect` exchange carries no ciphertext). Compiled only into
/// test builds and builds with the non-default `preshared-kem` feature;
/// default production builds carry [`KyberExchange`] alone.
#[cfg(any(test, feature = "preshared-kem"))]
pub struct PresharedExchange {
    seed: [u8; 32],
    counter: std::sync::Mutex<u64>,
}

#[cfg(any(test, feature = "preshared-kem"))]
impl PresharedExchange {
    /// New stream positioned at the first keypair.
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            seed,
            counter: std::sync::Mutex::new(0),
        }
    }
}

#[cfg(any(test, feature = "preshared-kem"))]
impl KeyExchange for PresharedExchange {
    fn generate_keypair(&self) -> KeyPair {
        let n = {
            let mut c = self.counter.lock().unwrap_or_else(|e| e.into_inner());
            let n = *c;
            *c += 1;
            n
        };
        let mut h = Shake256::default();
        h.update(b"LATTICE-PRESHARED-KEYS.v1");
        h.update(&self.seed);
        h.update(&n.to_le_bytes());
        let mut reader = h.finalize_xof();
        let mut public = vec![0u8; KEM_PUBLIC_KEY_SIZE];
        let mut secret = vec![0u8; KEM_SECRET_KEY_SIZE];
        reader.read(&mut public);
        reader.read(&mut secret);
        KeyPair::from_raw(public, secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_has_kem_sizes() {
        let kp = generate_keypair();
        assert_eq!(kp.public.len(), KEM_PUBLIC_KEY_SIZE);
        assert_eq!(kp.secret.len(), KEM_SECRET_KEY_SIZE);
    }

    #[test]
    fn shared_secret_is_symmetric() {
        let a = generate_keypair();
        let b = generate_keypair();
        let s1 = compute_shared_secret(&a, &b);
        let s2 = compute_shared_secret(&b, &a);
        assert_eq!(s1.as_bytes(), s2.as_bytes());
        assert!(!s1.is_null());
    }

    #[test]
    fn shared_secret_is_deterministic_per_pair() {
        let a = generate_keypair();
        let b = generate_keypair();
        assert_eq!(
            compute_shared_secret(&a, &b).as_bytes(),
            compute_shared_secret(&a, &b).as_bytes()
        );
    }

    #[test]
    fn distinct_pairs_derive_distinct_secrets() {
        let a = generate_keypair();
        let b = generate_keypair();
        let c = generate_keypair();
        assert_ne!(
            compute_shared_secret(&a, &b).as_bytes(),
            compute_shared_secret(&a, &c).as_bytes()
        );
    }

    #[test]
    fn malformed_keys_yield_null_sentinel() {
        let good = generate_keypair();
        let short = KeyPair::from_raw(vec![1u8; 10], vec![2u8; KEM_SECRET_KEY_SIZE]);
        let s = compute_shared_secret(&good, &short);
        assert!(s.is_null());
        assert_eq!(s.as_bytes(), &[0u8; CHANNEL_SECRET_SIZE]);
    }

    #[test]
    fn preshared_exchange_replays_the_same_stream() {
        let x = PresharedExchange::new([7u8; 32]);
        let y = PresharedExchange::new([7u8; 32]);
        let (a1, a2) = (x.generate_keypair(), x.generate_keypair());
        let (b1, b2) = (y.generate_keypair(), y.generate_keypair());
        assert_eq!(a1.public_key(), b1.public_key());
        assert_eq!(a2.public_key(), b2.public_key());
        assert_ne!(a1.public_key(), a2.public_key());
        assert_eq!(
            x.channel_secret(&a1, &a2).as_bytes(),
            y.channel_secret(&b2, &b1).as_bytes()
        );
    }
}
