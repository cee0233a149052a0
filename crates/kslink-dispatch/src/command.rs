//! The closed set of operations a request can carry.

use std::fmt;

use zeroize::Zeroize;

use kslink_core::{ContentKey, KeyIndex, KeystoreResult, RecordIndex, WrappedKey};
use kslink_link::KeystoreLink;

pub enum Command {
    Echo(String),
    ReadRecord(RecordIndex),
    WriteRecord { index: RecordIndex, data: Vec<u8> },
    SetKey { index: KeyIndex, key: [u8; 16] },
    EncryptBlock { index: KeyIndex, data: Vec<u8> },
    DecryptBlock { index: KeyIndex, data: Vec<u8> },
    EncryptHex { index: KeyIndex, data: Vec<u8> },
    DecryptHex { index: KeyIndex, data: Vec<u8> },
    WrapKey { index: KeyIndex, key: ContentKey },
    UnwrapKey { index: KeyIndex, wrapped: WrappedKey },
}

impl Command {
    /// Short operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Echo(_) => "echo",
            Command::ReadRecord(_) => "read_record",
            Command::WriteRecord { .. } => "write_record",
            Command::SetKey { .. } => "set_key",
            Command::EncryptBlock { .. } => "encrypt_block",
            Command::DecryptBlock { .. } => "decrypt_block",
            Command::EncryptHex { .. } => "encrypt_hex",
            Command::DecryptHex { .. } => "decrypt_hex",
            Command::WrapKey { .. } => "wrap_key",
            Command::UnwrapKey { .. } => "unwrap_key",
        }
    }

    /// Run against the link. Commands without a payload answer with empty bytes.
    pub fn run(self, link: &mut KeystoreLink) -> KeystoreResult<Vec<u8>> {
        match self {
            Command::Echo(msg) => link.echo(&msg).map(|()| Vec::new()),
            Command::ReadRecord(index) => link.read_record(index),
            Command::WriteRecord { index, data } => {
                link.write_record(index, &data).map(|()| Vec::new())
            }
            Command::SetKey { index, mut key } => {
                let result = link.set_key(index, &key).map(|()| Vec::new());
                key.zeroize();
                result
            }
            Command::EncryptBlock { index, data } => link.encrypt_block(index, &data),
            Command::DecryptBlock { index, data } => link.decrypt_block(index, &data),
            Command::EncryptHex { index, data } => link.encrypt_hex(index, &data),
            Command::DecryptHex { index, data } => link.decrypt_hex(index, &data),
            Command::WrapKey { index, key } => {
                kslink_wrap::wrap(link, index, &key).map(|w| w.as_bytes().to_vec())
            }
            Command::UnwrapKey { index, wrapped } => {
                kslink_wrap::unwrap(link, index, &wrapped).map(|k| k.as_bytes().to_vec())
            }
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Echo(msg) => f.debug_tuple("Echo").field(msg).finish(),
            Command::ReadRecord(index) => f.debug_tuple("ReadRecord").field(index).finish(),
            Command::WriteRecord { index, data } => f
                .debug_struct("WriteRecord")
                .field("index", index)
                .field("len", &data.len())
                .finish(),
            Command::SetKey { index, .. } => f
                .debug_struct("SetKey")
                .field("index", index)
                .field("key", &"[REDACTED]")
                .finish(),
            Command::WrapKey { index, key } => f
                .debug_struct("WrapKey")
                .field("index", index)
                .field("key", key)
                .finish(),
            Command::UnwrapKey { index, wrapped } => f
                .debug_struct("UnwrapKey")
                .field("index", index)
                .field("wrapped", wrapped)
                .finish(),
            Command::EncryptBlock { index, data }
            | Command::DecryptBlock { index, data }
            | Command::EncryptHex { index, data }
            | Command::DecryptHex { index, data } => f
                .debug_struct(self.name())
                .field("index", index)
                .field("len", &data.len())
                .finish(),
        }
    }
}
