//! kslink-core: shared types, config schema, and the keystore error taxonomy

pub mod config;
pub mod error;
pub mod types;

pub use config::KslinkConfig;
pub use error::{KeystoreError, KeystoreResult};
pub use types::{
    ContentKey, Endpoint, KeyIndex, RecordIndex, WrappedKey, BLOCK_SIZE, CONTENT_KEY_SIZE,
    MAX_BLOCK_PAYLOAD, WRAPPED_KEY_SIZE,
};
