//! Wrap and unwrap 32-byte content keys with two keystore-encrypted counter blocks.

use rand::RngCore;
use tracing::debug;
use zeroize::Zeroizing;

use kslink_core::{
    ContentKey, KeyIndex, KeystoreError, KeystoreResult, WrappedKey, BLOCK_SIZE,
    CONTENT_KEY_SIZE, WRAPPED_KEY_SIZE,
};
use kslink_link::KeystoreLink;

/// Anything that can encrypt blocks under a keystore-held key slot.
pub trait BlockCipher {
    /// Keystore name, for error reports.
    fn name(&self) -> &str;

    fn encrypt_block(&mut self, index: KeyIndex, block: &[u8]) -> KeystoreResult<Vec<u8>>;
}

impl BlockCipher for KeystoreLink {
    fn name(&self) -> &str {
        self.servername()
    }

    fn encrypt_block(&mut self, index: KeyIndex, block: &[u8]) -> KeystoreResult<Vec<u8>> {
        KeystoreLink::encrypt_block(self, index, block)
    }
}

/// Wrap `key` under key slot `index` with a fresh random nonce.
pub fn wrap<C: BlockCipher + ?Sized>(
    cipher: &mut C,
    index: KeyIndex,
    key: &ContentKey,
) -> KeystoreResult<WrappedKey> {
    let mut nonce = [0u8; BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let wrapped = wrap_with_nonce(cipher, index, key, nonce)?;
    debug!(keystore = %cipher.name(), key_index = index.get(), "content key wrapped");
    Ok(wrapped)
}

/// Deterministic wrap with a caller-chosen nonce. A nonce must never be
/// reused with the same key slot.
pub fn wrap_with_nonce<C: BlockCipher + ?Sized>(
    cipher: &mut C,
    index: KeyIndex,
    key: &ContentKey,
    nonce: [u8; BLOCK_SIZE],
) -> KeystoreResult<WrappedKey> {
    let (e1, e2) = pads(cipher, index, nonce)?;
    let (k1, k2) = key.halves();

    let mut out = [0u8; WRAPPED_KEY_SIZE];
    out[..BLOCK_SIZE].copy_from_slice(&nonce);
    xor_into(&mut out[BLOCK_SIZE..2 * BLOCK_SIZE], k1, &e1[..]);
    xor_into(&mut out[2 * BLOCK_SIZE..], k2, &e2[..]);
    Ok(WrappedKey::from_bytes(out))
}

/// Recover the content key sealed in `wrapped`. The same key slot (and key
/// material in it) that wrapped it must be used.
pub fn unwrap<C: BlockCipher + ?Sized>(
    cipher: &mut C,
    index: KeyIndex,
    wrapped: &WrappedKey,
) -> KeystoreResult<ContentKey> {
    let (e1, e2) = pads(cipher, index, wrapped.nonce())?;
    let (c1, c2) = wrapped.ciphertexts();

    let mut key = Zeroizing::new([0u8; CONTENT_KEY_SIZE]);
    xor_into(&mut key[..BLOCK_SIZE], c1, &e1[..]);
    xor_into(&mut key[BLOCK_SIZE..], c2, &e2[..]);
    debug!(keystore = %cipher.name(), key_index = index.get(), "content key unwrapped");
    Ok(ContentKey::from_bytes(*key))
}

type Pad = Zeroizing<[u8; BLOCK_SIZE]>;

/// `E(idx, r + 1)` and `E(idx, r + 2)`, counters taken mod 2^128.
fn pads<C: BlockCipher + ?Sized>(
    cipher: &mut C,
    index: KeyIndex,
    nonce: [u8; BLOCK_SIZE],
) -> KeystoreResult<(Pad, Pad)> {
    let r = u128::from_be_bytes(nonce);
    let e1 = pad(cipher, index, r.wrapping_add(1))?;
    let e2 = pad(cipher, index, r.wrapping_add(2))?;
    Ok((e1, e2))
}

fn pad<C: BlockCipher + ?Sized>(
    cipher: &mut C,
    index: KeyIndex,
    counter: u128,
) -> KeystoreResult<Pad> {
    let reply = Zeroizing::new(cipher.encrypt_block(index, &counter.to_be_bytes())?);
    if reply.len() < BLOCK_SIZE {
        return Err(KeystoreError::UnexpectedResponse {
            keystore: cipher.name().to_string(),
            operation: format!("key wrap pad with key {index}"),
            response: format!("{} byte reply, need {BLOCK_SIZE}", reply.len()),
        });
    }
    let mut pad = Zeroizing::new([0u8; BLOCK_SIZE]);
    pad.copy_from_slice(&reply[..BLOCK_SIZE]);
    Ok(pad)
}

fn xor_into(out: &mut [u8], a: &[u8], b: &[u8]) {
    for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
        *o = x ^ y;
    }
}
