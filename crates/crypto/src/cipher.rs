use chacha20poly1305::XChaCha20Poly1305;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};

use crate::error::CryptoError;
use crate::key::ContentKey;

/// XChaCha20 nonce size (192 bits); safe to draw at random per chunk.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

/// Associated data binding a ciphertext to its position in the file, so
/// chunks cannot be reordered undetected.
fn chunk_aad(chunk_index: u32) -> [u8; 4] {
    chunk_index.to_be_bytes()
}

/// Encrypts one chunk under a fresh random nonce.
///
/// Returns `(ciphertext, nonce)`; the ciphertext carries the tag.
pub fn seal_chunk(
    key: &ContentKey,
    chunk_index: u32,
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let aad = chunk_aad(chunk_index);
    let ciphertext = cipher
        .encrypt(
            (&nonce).into(),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::EncryptFailed)?;
    Ok((ciphertext, nonce))
}

/// Decrypts a chunk produced by [`seal_chunk`].
pub fn open_chunk(
    key: &ContentKey,
    chunk_index: u32,
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce: &[u8; NONCE_SIZE] =
        nonce
            .try_into()
            .map_err(|_| CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: nonce.len(),
            })?;
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::DecryptFailed);
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let aad = chunk_aad(chunk_index);
    cipher
        .decrypt(
            nonce.into(),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::DecryptFailed)
}
