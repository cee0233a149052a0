//! Keystore wire protocol: command framing and response classification.
//!
//! Text commands are single newline-terminated ASCII lines with lowercase
//! 2-hex indices. Block commands carry raw bytes after a three-byte prefix:
//!
//! ```text
//! A c <nibble> <payload...> \n      encrypt with key slot <nibble>
//! a c <nibble> <payload...> \n      decrypt with key slot <nibble>
//! ```

use kslink_core::{
    KeyIndex, KeystoreError, KeystoreResult, RecordIndex, BLOCK_SIZE, MAX_BLOCK_PAYLOAD,
};

pub const ECHO_PREFIX: &str = "?01";
pub const TERMINATE: &[u8] = b"?02\n";

const OK: &[u8] = b"OK";
const ERROR: &[u8] = b"ERROR";

/// Block cipher direction, selects the `A`/`a` command family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

impl Direction {
    fn opcode(self) -> char {
        match self {
            Direction::Encrypt => 'A',
            Direction::Decrypt => 'a',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::Encrypt => "encrypt",
            Direction::Decrypt => "decrypt",
        }
    }
}

pub fn echo(msg: &str) -> KeystoreResult<Vec<u8>> {
    reject_newline("echo message", msg.as_bytes())?;
    Ok(format!("{ECHO_PREFIX}{msg}\n").into_bytes())
}

pub fn read_record(index: RecordIndex) -> Vec<u8> {
    format!("I{index}\n").into_bytes()
}

pub fn write_record(index: RecordIndex, data: &[u8]) -> KeystoreResult<Vec<u8>> {
    reject_newline("record data", data)?;
    let mut frame = format!("Z{index}").into_bytes();
    frame.extend_from_slice(data);
    frame.push(b'\n');
    Ok(frame)
}

pub fn set_key(index: KeyIndex, key: &[u8; 16]) -> Vec<u8> {
    format!("t{index}{}\n", hex::encode(key)).into_bytes()
}

/// Text-mode block command: `A`/`a` + 2-hex index + hex payload.
pub fn block_hex(direction: Direction, index: KeyIndex, payload: &[u8]) -> KeystoreResult<Vec<u8>> {
    check_block_payload(payload)?;
    Ok(format!("{}{index}{}\n", direction.opcode(), hex::encode(payload)).into_bytes())
}

/// Binary block command: `Ac`/`ac` + key nibble + raw payload.
pub fn block_binary(
    direction: Direction,
    index: KeyIndex,
    payload: &[u8],
) -> KeystoreResult<Vec<u8>> {
    check_block_payload(payload)?;
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(format!("{}c{}", direction.opcode(), index.nibble()).as_bytes());
    frame.extend_from_slice(payload);
    frame.push(b'\n');
    Ok(frame)
}

/// Block payloads are 1..=16 AES blocks.
pub fn check_block_payload(payload: &[u8]) -> KeystoreResult<()> {
    let len = payload.len();
    if len == 0 || len % BLOCK_SIZE != 0 || len > MAX_BLOCK_PAYLOAD {
        return Err(KeystoreError::input(format!(
            "block payload must be a positive multiple of {BLOCK_SIZE} up to {MAX_BLOCK_PAYLOAD} bytes, got {len}"
        )));
    }
    Ok(())
}

fn reject_newline(what: &str, data: &[u8]) -> KeystoreResult<()> {
    if data.contains(&b'\n') {
        return Err(KeystoreError::input(format!("{what} must not contain a newline")));
    }
    Ok(())
}

pub fn is_error(response: &[u8]) -> bool {
    response.starts_with(ERROR)
}

/// Render a response for error messages without dumping binary noise.
pub fn excerpt(response: &[u8]) -> String {
    let text = String::from_utf8_lossy(&response[..response.len().min(64)]);
    text.trim_end().to_string()
}

/// `ERROR...` → Protocol, anything else passes.
pub fn reject_error(keystore: &str, operation: &str, response: &[u8]) -> KeystoreResult<()> {
    if is_error(response) {
        return Err(KeystoreError::Protocol {
            keystore: keystore.to_string(),
            operation: operation.to_string(),
            response: excerpt(response),
        });
    }
    Ok(())
}

/// `OK...` passes, `ERROR...` → Protocol, anything else → UnexpectedResponse.
pub fn expect_ok(keystore: &str, operation: &str, response: &[u8]) -> KeystoreResult<()> {
    if response.starts_with(OK) {
        return Ok(());
    }
    reject_error(keystore, operation, response)?;
    Err(KeystoreError::UnexpectedResponse {
        keystore: keystore.to_string(),
        operation: operation.to_string(),
        response: excerpt(response),
    })
}

/// Decode a hex text response (trailing whitespace tolerated).
pub fn decode_hex(keystore: &str, operation: &str, response: &[u8]) -> KeystoreResult<Vec<u8>> {
    reject_error(keystore, operation, response)?;
    let text = std::str::from_utf8(response).map(str::trim).unwrap_or_default();
    match hex::decode(text) {
        Ok(bytes) if !bytes.is_empty() => Ok(bytes),
        _ => Err(KeystoreError::UnexpectedResponse {
            keystore: keystore.to_string(),
            operation: operation.to_string(),
            response: excerpt(response),
        }),
    }
}
