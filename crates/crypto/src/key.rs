use base64::{Engine, engine::general_purpose::STANDARD};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// Content-encryption key size (256 bits).
pub const KEY_SIZE: usize = 32;

/// Per-file content-encryption key. Wiped from memory on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct ContentKey {
    bytes: [u8; KEY_SIZE],
}

impl ContentKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Generates a random key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
        Self { bytes }
    }

    pub fn try_from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self { bytes })
    }

    /// Transport encoding used on the worker boundary (standard base64).
    pub fn encode(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    pub fn decode(encoded: &str) -> Result<Self, CryptoError> {
        let raw = zeroize::Zeroizing::new(STANDARD.decode(encoded)?);
        Self::try_from_slice(&raw)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey").finish_non_exhaustive()
    }
}
