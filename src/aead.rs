#![forbid(unsafe_code)]

//! XChaCha20-Poly1305 sealing for IPC frames.
//!
//! Every frame carries its own random 24-byte nonce, drawn from the system
//! CSRNG at seal time. Open failures carry no detail: a frame that does not
//! authenticate is indistinguishable from one that never arrived.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

/// Nonce width for XChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag width appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

/// Sealing failed inside the cipher. Practically unreachable for in-memory
/// buffers, but propagated rather than swallowed.
#[derive(Debug, Error)]
#[error("aead seal failed")]
pub struct SealError;

/// Encrypts `plain` under `key`, returning the fresh nonce and the
/// ciphertext with its appended tag (`plain.len() + 16` bytes).
pub fn seal(plain: &[u8], key: &[u8; 32]) -> Result<([u8; NONCE_SIZE], Vec<u8>), SealError> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), plain)
        .map_err(|_| SealError)?;
    Ok((nonce, sealed))
}

/// Decrypts a sealed buffer. `None` when the tag does not verify or the
/// buffer is shorter than a tag.
pub fn open(sealed: &[u8], key: &[u8; 32], nonce: &[u8; NONCE_SIZE]) -> Option<Vec<u8>> {
    if sealed.len() < TAG_SIZE {
        return None;
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher.decrypt(XNonce::from_slice(nonce), sealed).ok()
}
