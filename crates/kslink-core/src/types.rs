use std::fmt;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretSlice};
use zeroize::Zeroize;

use crate::error::{KeystoreError, KeystoreResult};

/// Highest record slot a keystore exposes
pub const MAX_RECORD_INDEX: u8 = 31;

/// Highest AES key slot a keystore exposes
pub const MAX_KEY_INDEX: u8 = 3;

/// AES block size; every block payload is a multiple of this
pub const BLOCK_SIZE: usize = 16;

/// Largest payload accepted by a single block command (16 blocks)
pub const MAX_BLOCK_PAYLOAD: usize = 256;

/// Content-encryption key size (256-bit)
pub const CONTENT_KEY_SIZE: usize = 32;

/// nonce(16) || c1(16) || c2(16)
pub const WRAPPED_KEY_SIZE: usize = 48;

/// PSK identity sent during the handshake when none is configured
pub const DEFAULT_PSK_IDENTITY: &str = "Client_identity";

/// Where a keystore lives and how to authenticate to it.
///
/// `servername` is both the SNI sent in the handshake and the name the
/// dispatcher routes on, so it must be unique process-wide.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
    pub servername: String,
    pub psk_identity: String,
    psk: Arc<SecretSlice<u8>>,
}

impl Endpoint {
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        servername: impl Into<String>,
        psk: Vec<u8>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            servername: servername.into(),
            psk_identity: DEFAULT_PSK_IDENTITY.to_string(),
            psk: Arc::new(SecretSlice::from(psk)),
        }
    }

    pub fn with_psk_identity(mut self, identity: impl Into<String>) -> Self {
        self.psk_identity = identity.into();
        self
    }

    /// Shared handle to the PSK, for handshake callbacks that outlive `&self`.
    pub fn psk(&self) -> Arc<SecretSlice<u8>> {
        Arc::clone(&self.psk)
    }

    pub fn psk_len(&self) -> usize {
        self.psk.expose_secret().len()
    }
}

/// Record slot on a keystore, `0..=31`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordIndex(u8);

impl RecordIndex {
    pub fn new(index: i64) -> KeystoreResult<Self> {
        if (0..=i64::from(MAX_RECORD_INDEX)).contains(&index) {
            Ok(Self(index as u8))
        } else {
            Err(KeystoreError::input(format!(
                "record index {index} out of range 0..={MAX_RECORD_INDEX}"
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for RecordIndex {
    type Error = KeystoreError;

    fn try_from(index: i64) -> KeystoreResult<Self> {
        Self::new(index)
    }
}

impl fmt::Display for RecordIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// AES key slot on a keystore, `0..=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyIndex(u8);

impl KeyIndex {
    pub fn new(index: i64) -> KeystoreResult<Self> {
        if (0..=i64::from(MAX_KEY_INDEX)).contains(&index) {
            Ok(Self(index as u8))
        } else {
            Err(KeystoreError::input(format!(
                "key index {index} out of range 0..={MAX_KEY_INDEX}"
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Single uppercase hex digit used by the binary block commands.
    pub fn nibble(self) -> char {
        char::from_digit(u32::from(self.0), 16)
            .unwrap_or('0')
            .to_ascii_uppercase()
    }
}

impl TryFrom<i64> for KeyIndex {
    type Error = KeystoreError;

    fn try_from(index: i64) -> KeystoreResult<Self> {
        Self::new(index)
    }
}

impl fmt::Display for KeyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// A 256-bit content-encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct ContentKey {
    bytes: [u8; CONTENT_KEY_SIZE],
}

impl ContentKey {
    pub fn from_bytes(bytes: [u8; CONTENT_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> KeystoreResult<Self> {
        let bytes: [u8; CONTENT_KEY_SIZE] = bytes.try_into().map_err(|_| {
            KeystoreError::input(format!(
                "content key must be {CONTENT_KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_KEY_SIZE] {
        &self.bytes
    }

    /// The two 16-byte halves `k1`, `k2`.
    pub fn halves(&self) -> (&[u8], &[u8]) {
        self.bytes.split_at(BLOCK_SIZE)
    }
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Opaque 48-byte wrapped content key: `nonce || c1 || c2`.
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedKey {
    bytes: [u8; WRAPPED_KEY_SIZE],
}

impl WrappedKey {
    pub fn from_bytes(bytes: [u8; WRAPPED_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> KeystoreResult<Self> {
        let bytes: [u8; WRAPPED_KEY_SIZE] = bytes.try_into().map_err(|_| {
            KeystoreError::input(format!(
                "wrapped key must be {WRAPPED_KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; WRAPPED_KEY_SIZE] {
        &self.bytes
    }

    pub fn nonce(&self) -> [u8; BLOCK_SIZE] {
        let mut nonce = [0u8; BLOCK_SIZE];
        nonce.copy_from_slice(&self.bytes[..BLOCK_SIZE]);
        nonce
    }

    /// The two ciphertext halves `c1`, `c2`.
    pub fn ciphertexts(&self) -> (&[u8], &[u8]) {
        self.bytes[BLOCK_SIZE..].split_at(BLOCK_SIZE)
    }
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedKey({})", hex::encode(self.bytes))
    }
}
