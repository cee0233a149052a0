//! Relay frames: compact binary requests forwarded on behalf of remote callers.
//!
//! ```text
//! byte 0   op        0 read | 1 encrypt | 2 decrypt | 3 wrap | 4 unwrap
//! byte 1   n         keystore number, routed to "key<n>.com"
//! byte 2   index     record index (read) or key index (others)
//! 3..      data      blocks, 32-byte key or 48-byte wrapped key
//! ```
//!
//! Replies are `0x00 ‖ payload` on success and the ASCII bytes `01` on failure.

use std::mem;
use std::time::Duration;

use tracing::{debug, warn};
use zeroize::Zeroize;

use kslink_core::{
    ContentKey, KeyIndex, KeystoreError, KeystoreResult, RecordIndex, WrappedKey,
};

use crate::command::Command;
use crate::dispatcher::Dispatcher;
use crate::request::Request;

const HEADER_LEN: usize = 3;
const REPLY_OK: u8 = 0x00;
/// Reply sent for any failure; the cause is logged, never forwarded.
pub const REPLY_FAILED: &[u8] = b"01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOp {
    Read = 0,
    Encrypt = 1,
    Decrypt = 2,
    Wrap = 3,
    Unwrap = 4,
}

impl TryFrom<u8> for RelayOp {
    type Error = KeystoreError;

    fn try_from(byte: u8) -> KeystoreResult<Self> {
        Ok(match byte {
            0 => RelayOp::Read,
            1 => RelayOp::Encrypt,
            2 => RelayOp::Decrypt,
            3 => RelayOp::Wrap,
            4 => RelayOp::Unwrap,
            other => {
                return Err(KeystoreError::input(format!(
                    "unknown relay command {other:#04x}"
                )))
            }
        })
    }
}

/// Servername for relay keystore number `n`.
pub fn keystore_name(n: u8) -> String {
    format!("key{n}.com")
}

/// A decoded relay frame. The data is zeroized on drop since it may hold a
/// content key.
pub struct RelayFrame {
    pub op: RelayOp,
    pub keystore: u8,
    pub index: u8,
    pub data: Vec<u8>,
}

impl RelayFrame {
    pub fn decode(frame: &[u8]) -> KeystoreResult<Self> {
        if frame.len() < HEADER_LEN {
            return Err(KeystoreError::input(format!(
                "relay frame too short: {} bytes",
                frame.len()
            )));
        }
        Ok(Self {
            op: RelayOp::try_from(frame[0])?,
            keystore: frame[1],
            index: frame[2],
            data: frame[HEADER_LEN..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.extend_from_slice(&[self.op as u8, self.keystore, self.index]);
        out.extend_from_slice(&self.data);
        out
    }

    /// Validate indices and payload sizes and build the request.
    pub fn into_request(mut self) -> KeystoreResult<Request> {
        let keystore = keystore_name(self.keystore);
        let index = i64::from(self.index);
        let data = mem::take(&mut self.data);

        let command = match self.op {
            RelayOp::Read => {
                if !data.is_empty() {
                    return Err(KeystoreError::input("read frame carries no data"));
                }
                Command::ReadRecord(RecordIndex::new(index)?)
            }
            RelayOp::Encrypt => Command::EncryptBlock {
                index: KeyIndex::new(index)?,
                data,
            },
            RelayOp::Decrypt => Command::DecryptBlock {
                index: KeyIndex::new(index)?,
                data,
            },
            RelayOp::Wrap => {
                let mut data = data;
                let key = ContentKey::from_slice(&data);
                data.zeroize();
                Command::WrapKey {
                    index: KeyIndex::new(index)?,
                    key: key?,
                }
            }
            RelayOp::Unwrap => Command::UnwrapKey {
                index: KeyIndex::new(index)?,
                wrapped: WrappedKey::from_slice(&data)?,
            },
        };
        Ok(Request::new(keystore, command))
    }
}

impl Drop for RelayFrame {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl std::fmt::Debug for RelayFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayFrame")
            .field("op", &self.op)
            .field("keystore", &self.keystore)
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

pub fn encode_reply(result: &KeystoreResult<Vec<u8>>) -> Vec<u8> {
    match result {
        Ok(payload) => {
            let mut out = Vec::with_capacity(1 + payload.len());
            out.push(REPLY_OK);
            out.extend_from_slice(payload);
            out
        }
        Err(_) => REPLY_FAILED.to_vec(),
    }
}

/// Decode, dispatch and wait for one relay frame; always produces a reply.
pub fn handle(dispatcher: &Dispatcher, frame: &[u8], timeout: Option<Duration>) -> Vec<u8> {
    let result = RelayFrame::decode(frame)
        .and_then(RelayFrame::into_request)
        .and_then(|request| {
            dispatcher.dispatch(&request)?;
            debug!(keystore = %request.keystore(), op = request.operation(), "relay request queued");
            request.get_response(timeout)
        });
    if let Err(e) = &result {
        warn!(error = %e, "relay request failed");
    }
    encode_reply(&result)
}
