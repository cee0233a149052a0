//! kslink-wrap: content-key wrapping under a keystore-held block key
//!
//! The keystore never sees the content key. It only encrypts two counter
//! blocks derived from a fresh nonce, and the resulting pads are XORed into
//! the key halves locally:
//!
//! ```text
//! r  ← 16 random bytes
//! e1 = E(idx, r + 1)     e2 = E(idx, r + 2)        (128-bit big-endian, mod 2^128)
//! wrapped = r ‖ (k1 ⊕ e1) ‖ (k2 ⊕ e2)              48 bytes
//! ```

pub mod wrap;

pub use wrap::{unwrap, wrap, wrap_with_nonce, BlockCipher};
