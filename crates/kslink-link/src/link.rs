//! One persistent connection to one keystore, with the idle-close recovery policy.
//!
//! Keystores drop connections that sit idle past a fixed window. The drop is
//! only visible when the next command is answered by EOF, so every command
//! goes through [`KeystoreLink::send_command`], which reconnects and resends
//! at most once when auto-reconnect is enabled.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use kslink_core::config::ClientConfig;
use kslink_core::{Endpoint, KeyIndex, KeystoreError, KeystoreResult, RecordIndex};

use crate::tls::PskTlsConnector;
use crate::transport::{Connector, Transport};
use crate::wire::{self, Direction};

/// One response is read per command
const RECV_BUFFER: usize = 4096;

pub struct KeystoreLink {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    stream: Option<Box<dyn Transport>>,
    auto_reconnect: bool,
}

impl KeystoreLink {
    /// Create an unconnected link. Auto-reconnect starts enabled.
    pub fn new(endpoint: Endpoint, connector: Arc<dyn Connector>) -> Self {
        Self {
            endpoint,
            connector,
            stream: None,
            auto_reconnect: true,
        }
    }

    /// Link over the PSK-TLS connector, with timeouts and reconnect policy from `client`.
    pub fn tls(endpoint: Endpoint, client: &ClientConfig) -> Self {
        Self::new(endpoint, Arc::new(PskTlsConnector::from_config(client)))
            .with_auto_reconnect(client.auto_reconnect)
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn servername(&self) -> &str {
        &self.endpoint.servername
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Open the transport and handshake. Replaces any existing connection.
    pub fn connect(&mut self) -> KeystoreResult<()> {
        self.stream = None;
        let stream = self.connector.connect(&self.endpoint)?;
        self.stream = Some(stream);
        info!(keystore = %self.endpoint.servername, "connected");
        Ok(())
    }

    /// Liveness probe: the keystore answers with the message it was sent.
    pub fn echo(&mut self, msg: &str) -> KeystoreResult<()> {
        let response = self.send_command(&wire::echo(msg)?)?;
        if !response.starts_with(msg.as_bytes()) {
            return Err(KeystoreError::UnexpectedResponse {
                keystore: self.endpoint.servername.clone(),
                operation: "echo".into(),
                response: wire::excerpt(&response),
            });
        }
        Ok(())
    }

    /// Read the raw contents of a record slot.
    pub fn read_record(&mut self, index: RecordIndex) -> KeystoreResult<Vec<u8>> {
        let response = self.send_command(&wire::read_record(index))?;
        wire::reject_error(
            &self.endpoint.servername,
            &format!("read record {index}"),
            &response,
        )?;
        Ok(response)
    }

    pub fn write_record(&mut self, index: RecordIndex, data: &[u8]) -> KeystoreResult<()> {
        let frame = wire::write_record(index, data)?;
        let response = self.send_command(&frame)?;
        wire::expect_ok(
            &self.endpoint.servername,
            &format!("write record {index}"),
            &response,
        )
    }

    /// Install a 128-bit AES key in a key slot.
    pub fn set_key(&mut self, index: KeyIndex, key: &[u8; 16]) -> KeystoreResult<()> {
        let response = self.send_command(&wire::set_key(index, key))?;
        wire::expect_ok(
            &self.endpoint.servername,
            &format!("set key {index}"),
            &response,
        )
    }

    pub fn encrypt_block(&mut self, index: KeyIndex, payload: &[u8]) -> KeystoreResult<Vec<u8>> {
        self.block_binary(Direction::Encrypt, index, payload)
    }

    pub fn decrypt_block(&mut self, index: KeyIndex, payload: &[u8]) -> KeystoreResult<Vec<u8>> {
        self.block_binary(Direction::Decrypt, index, payload)
    }

    /// Text-mode encrypt: payload and answer travel hex-encoded.
    pub fn encrypt_hex(&mut self, index: KeyIndex, payload: &[u8]) -> KeystoreResult<Vec<u8>> {
        self.block_hex(Direction::Encrypt, index, payload)
    }

    pub fn decrypt_hex(&mut self, index: KeyIndex, payload: &[u8]) -> KeystoreResult<Vec<u8>> {
        self.block_hex(Direction::Decrypt, index, payload)
    }

    fn block_binary(
        &mut self,
        direction: Direction,
        index: KeyIndex,
        payload: &[u8],
    ) -> KeystoreResult<Vec<u8>> {
        let frame = wire::block_binary(direction, index, payload)?;
        match self.send_command(&frame) {
            // The keystore hangs up instead of answering a block command it rejects.
            Err(KeystoreError::ConnectionClosed(keystore)) => Err(KeystoreError::Protocol {
                keystore,
                operation: format!("{} with key {index}", direction.name()),
                response: "connection closed mid-command".into(),
            }),
            other => other,
        }
    }

    fn block_hex(
        &mut self,
        direction: Direction,
        index: KeyIndex,
        payload: &[u8],
    ) -> KeystoreResult<Vec<u8>> {
        let frame = wire::block_hex(direction, index, payload)?;
        let response = self.send_command(&frame)?;
        wire::decode_hex(
            &self.endpoint.servername,
            &format!("{} (text) with key {index}", direction.name()),
            &response,
        )
    }

    /// Send the termination command and drop the transport. No-op when unconnected.
    pub fn close(&mut self) -> KeystoreResult<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        debug!(keystore = %self.endpoint.servername, "closing connection");
        stream
            .write_all(wire::TERMINATE)
            .and_then(|()| stream.flush())
            .map_err(|e| io_failure(&self.endpoint.servername, "terminate", e))
    }

    /// Exchange one frame for one response, connecting lazily.
    ///
    /// An idle close (EOF on read, broken pipe on write) is retried once after
    /// a reconnect when auto-reconnect is enabled; a failure of that retry is
    /// `ReconnectFailed`. Without auto-reconnect it surfaces as
    /// `ConnectionClosed`.
    pub fn send_command(&mut self, frame: &[u8]) -> KeystoreResult<Vec<u8>> {
        if self.stream.is_none() {
            self.connect()?;
        }

        match self.exchange(frame) {
            Err(KeystoreError::ConnectionClosed(keystore)) if self.auto_reconnect => {
                warn!(keystore = %keystore, "connection closed by keystore, reconnecting");
                match self.connect().and_then(|()| self.exchange(frame)) {
                    Ok(response) => Ok(response),
                    Err(source) => {
                        self.stream = None;
                        Err(KeystoreError::ReconnectFailed {
                            keystore,
                            source: Box::new(source),
                        })
                    }
                }
            }
            Err(e) => {
                if e.is_transport() {
                    self.stream = None;
                }
                Err(e)
            }
            ok => ok,
        }
    }

    fn exchange(&mut self, frame: &[u8]) -> KeystoreResult<Vec<u8>> {
        let keystore = &self.endpoint.servername;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| KeystoreError::ConnectionClosed(keystore.clone()))?;

        trace!(keystore = %keystore, bytes = frame.len(), "send");
        stream
            .write_all(frame)
            .and_then(|()| stream.flush())
            .map_err(|e| io_failure(keystore, "send", e))?;

        let mut buf = vec![0u8; RECV_BUFFER];
        let n = stream
            .read(&mut buf)
            .map_err(|e| io_failure(keystore, "receive", e))?;
        if n == 0 {
            return Err(KeystoreError::ConnectionClosed(keystore.clone()));
        }
        buf.truncate(n);
        trace!(keystore = %keystore, bytes = n, "recv");
        Ok(buf)
    }
}

fn io_failure(keystore: &str, what: &str, e: io::Error) -> KeystoreError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => KeystoreError::ConnectionClosed(keystore.to_string()),
        _ => KeystoreError::Connection {
            keystore: keystore.to_string(),
            reason: format!("{what} failed: {e}"),
        },
    }
}

impl fmt::Debug for KeystoreLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeystoreLink")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.stream.is_some())
            .field("auto_reconnect", &self.auto_reconnect)
            .finish()
    }
}
