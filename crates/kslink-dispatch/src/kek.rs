//! Key-encryption-key provider for storage handlers: wraps content keys under
//! one fixed keystore key slot, through the dispatcher.
//!
//! [`KekProvider`] ships the whole wrap to the keystore's worker as one
//! command. [`RoutedCipher`] instead runs the codec on the calling thread and
//! routes each block encryption through the dispatcher as its own request.

use std::sync::Arc;
use std::time::Duration;

use zeroize::Zeroize;

use kslink_core::{ContentKey, KeyIndex, KeystoreResult, WrappedKey};
use kslink_wrap::BlockCipher;

use crate::command::Command;
use crate::dispatcher::Dispatcher;
use crate::request::Request;

#[derive(Clone)]
pub struct KekProvider {
    dispatcher: Arc<Dispatcher>,
    keystore: String,
    key_index: KeyIndex,
    timeout: Option<Duration>,
}

impl KekProvider {
    pub fn new(dispatcher: Arc<Dispatcher>, keystore: impl Into<String>, key_index: KeyIndex) -> Self {
        Self {
            dispatcher,
            keystore: keystore.into(),
            key_index,
            timeout: None,
        }
    }

    /// Bound each wrap/unwrap wait. Unbounded by default.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn keystore(&self) -> &str {
        &self.keystore
    }

    pub fn wrap_key(&self, key: &ContentKey) -> KeystoreResult<WrappedKey> {
        let bytes = self.call(Command::WrapKey {
            index: self.key_index,
            key: key.clone(),
        })?;
        WrappedKey::from_slice(&bytes)
    }

    pub fn unwrap_key(&self, wrapped: &WrappedKey) -> KeystoreResult<ContentKey> {
        let mut bytes = self.call(Command::UnwrapKey {
            index: self.key_index,
            wrapped: wrapped.clone(),
        })?;
        let key = ContentKey::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    fn call(&self, command: Command) -> KeystoreResult<Vec<u8>> {
        let request = Request::new(self.keystore.clone(), command);
        self.dispatcher.dispatch(&request)?;
        request.get_response(self.timeout)
    }
}

impl std::fmt::Debug for KekProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KekProvider")
            .field("keystore", &self.keystore)
            .field("key_index", &self.key_index)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A [`BlockCipher`] whose blocks are encrypted by a dispatched keystore.
pub struct RoutedCipher<'a> {
    dispatcher: &'a Dispatcher,
    keystore: String,
    timeout: Option<Duration>,
}

impl<'a> RoutedCipher<'a> {
    pub fn new(dispatcher: &'a Dispatcher, keystore: impl Into<String>) -> Self {
        Self {
            dispatcher,
            keystore: keystore.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl BlockCipher for RoutedCipher<'_> {
    fn name(&self) -> &str {
        &self.keystore
    }

    fn encrypt_block(&mut self, index: KeyIndex, block: &[u8]) -> KeystoreResult<Vec<u8>> {
        let request = Request::new(
            self.keystore.clone(),
            Command::EncryptBlock {
                index,
                data: block.to_vec(),
            },
        );
        self.dispatcher.dispatch(&request)?;
        request.get_response(self.timeout)
    }
}
