//! In-process stand-ins for a keystore, for tests (feature `mock`).
//!
//! - [`ScriptedConnector`] replays canned responses and records every frame written.
//! - [`MockKeystore`] speaks the keystore protocol against in-memory records
//!   and key slots, and can expire its live sessions to emulate the idle
//!   disconnect.
//!
//! Both treat each `write` call as one complete frame, which holds for
//! [`KeystoreLink`](crate::KeystoreLink) since it writes a frame with a single
//! `write_all` into these transports.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kslink_core::{Endpoint, KeystoreError, KeystoreResult};

use crate::transport::{Connector, Transport};

// ── ScriptedConnector ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Reply {
    Data(Vec<u8>),
    Closed,
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Reply>,
    writes: Vec<Vec<u8>>,
    connects: usize,
    refuse_connects: usize,
}

/// Replays queued replies in order, across reconnects.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next read.
    pub fn reply(&self, bytes: impl Into<Vec<u8>>) -> &Self {
        self.lock().replies.push_back(Reply::Data(bytes.into()));
        self
    }

    /// The next read sees EOF, as after an idle disconnect.
    pub fn close_next(&self) -> &Self {
        self.lock().replies.push_back(Reply::Closed);
        self
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse_connects(&self, n: usize) -> &Self {
        self.lock().refuse_connects = n;
        self
    }

    /// Every frame written so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().expect("script lock poisoned")
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, endpoint: &Endpoint) -> KeystoreResult<Box<dyn Transport>> {
        let mut script = self.lock();
        if script.refuse_connects > 0 {
            script.refuse_connects -= 1;
            return Err(KeystoreError::Connection {
                keystore: endpoint.servername.clone(),
                reason: "connection refused (scripted)".into(),
            });
        }
        script.connects += 1;
        Ok(Box::new(ScriptedStream {
            script: Arc::clone(&self.script),
        }))
    }
}

struct ScriptedStream {
    script: Arc<Mutex<Script>>,
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut script = self.script.lock().expect("script lock poisoned");
        script.writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut script = self.script.lock().expect("script lock poisoned");
        match script.replies.pop_front() {
            Some(Reply::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(Reply::Closed) => Ok(0),
            None => Err(io::Error::new(io::ErrorKind::TimedOut, "no scripted reply")),
        }
    }
}

// ── MockKeystore ──────────────────────────────────────────────────────────

const RECORDS: usize = 32;
const KEY_SLOTS: usize = 4;

#[derive(Debug)]
struct KeystoreState {
    name: String,
    records: Vec<Option<Vec<u8>>>,
    keys: [[u8; 16]; KEY_SLOTS],
    /// Sessions opened before the current generation read EOF
    generation: u64,
    refuse: bool,
    latency: Duration,
    connects: usize,
    commands: Vec<String>,
}

/// A keystore emulated in memory.
///
/// Block commands apply a reversible keyed transform (XOR with a per-slot pad
/// derived from the slot key via BLAKE3). It is deterministic per key slot,
/// which is all the wrap/unwrap tests need; it is not AES.
#[derive(Debug, Clone)]
pub struct MockKeystore {
    state: Arc<Mutex<KeystoreState>>,
}

impl MockKeystore {
    /// Key slots are seeded from the name, so two mocks never share key material.
    pub fn new(name: &str) -> Self {
        let mut keys = [[0u8; 16]; KEY_SLOTS];
        for (slot, key) in keys.iter_mut().enumerate() {
            let seed = blake3::hash(format!("{name}/{slot}").as_bytes());
            key.copy_from_slice(&seed.as_bytes()[..16]);
        }
        Self {
            state: Arc::new(Mutex::new(KeystoreState {
                name: name.to_string(),
                records: vec![None; RECORDS],
                keys,
                generation: 0,
                refuse: false,
                latency: Duration::ZERO,
                connects: 0,
                commands: Vec::new(),
            })),
        }
    }

    /// Pre-load a record slot.
    pub fn with_record(self, index: usize, data: &[u8]) -> Self {
        self.lock().records[index] = Some(data.to_vec());
        self
    }

    /// Delay every response, to make one keystore reliably slower than another.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// Drop every open session, as the keystore does after its idle window.
    pub fn expire_sessions(&self) {
        self.lock().generation += 1;
    }

    /// Refuse (or accept again) new connections.
    pub fn set_refuse(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Command prefixes seen, e.g. `["?01", "I", "Ac"]`.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn record(&self, index: usize) -> Option<Vec<u8>> {
        self.lock().records[index].clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KeystoreState> {
        self.state.lock().expect("mock keystore lock poisoned")
    }
}

impl Connector for MockKeystore {
    fn connect(&self, endpoint: &Endpoint) -> KeystoreResult<Box<dyn Transport>> {
        let mut state = self.lock();
        if state.refuse {
            return Err(KeystoreError::Connection {
                keystore: endpoint.servername.clone(),
                reason: format!("{} refused the connection", state.name),
            });
        }
        state.connects += 1;
        Ok(Box::new(MockSession {
            keystore: self.clone(),
            generation: state.generation,
            pending: None,
            hung_up: false,
        }))
    }
}

enum Outcome {
    Reply(Vec<u8>),
    HangUp,
}

struct MockSession {
    keystore: MockKeystore,
    generation: u64,
    pending: Option<Vec<u8>>,
    hung_up: bool,
}

impl MockSession {
    fn handle(&self, state: &mut KeystoreState, frame: &[u8]) -> Outcome {
        let frame = frame.strip_suffix(b"\n").unwrap_or(frame);
        let error = |msg: &str| Outcome::Reply(format!("ERROR {msg}").into_bytes());

        if let Some(msg) = frame.strip_prefix(b"?01") {
            state.commands.push("?01".into());
            return Outcome::Reply(msg.to_vec());
        }
        if frame.starts_with(b"?02") {
            state.commands.push("?02".into());
            return Outcome::HangUp;
        }
        if frame.len() >= 3 && (frame.starts_with(b"Ac") || frame.starts_with(b"ac")) {
            let opcode = String::from_utf8_lossy(&frame[..2]).into_owned();
            state.commands.push(opcode);
            let slot = (frame[2] as char).to_digit(16).map(|d| d as usize);
            let payload = &frame[3..];
            return match slot {
                Some(slot) if slot < KEY_SLOTS && valid_blocks(payload) => {
                    Outcome::Reply(transform(&state.keys[slot], payload))
                }
                _ => Outcome::HangUp,
            };
        }

        let Some((&opcode, rest)) = frame.split_first() else {
            return error("empty command");
        };
        state.commands.push((opcode as char).to_string());
        let Some(index) = rest
            .get(..2)
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| usize::from_str_radix(h, 16).ok())
        else {
            return error("bad index");
        };
        let body = &rest[2..];

        match opcode {
            b'I' => match state.records.get(index) {
                Some(Some(data)) => Outcome::Reply(data.clone()),
                Some(None) => error("record empty"),
                None => error("bad index"),
            },
            b'Z' => match state.records.get_mut(index) {
                Some(slot) => {
                    *slot = Some(body.to_vec());
                    Outcome::Reply(b"OK".to_vec())
                }
                None => error("bad index"),
            },
            b't' => {
                let key = std::str::from_utf8(body)
                    .ok()
                    .and_then(|h| hex::decode(h).ok())
                    .and_then(|k| <[u8; 16]>::try_from(k).ok());
                match (key, state.keys.get_mut(index)) {
                    (Some(key), Some(slot)) => {
                        *slot = key;
                        Outcome::Reply(b"OK".to_vec())
                    }
                    _ => error("bad key"),
                }
            }
            b'A' | b'a' => {
                let payload = std::str::from_utf8(body)
                    .ok()
                    .and_then(|h| hex::decode(h).ok())
                    .filter(|p| valid_blocks(p));
                match (payload, state.keys.get(index)) {
                    (Some(payload), Some(key)) => {
                        Outcome::Reply(hex::encode(transform(key, &payload)).into_bytes())
                    }
                    _ => error("bad block"),
                }
            }
            _ => error("unknown command"),
        }
    }
}

impl Write for MockSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.hung_up {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
        }
        let mut state = self.keystore.lock();
        if state.generation != self.generation {
            // Expired: the write lands in a dead socket, the read sees EOF.
            self.hung_up = true;
            return Ok(buf.len());
        }
        match self.handle(&mut state, buf) {
            Outcome::Reply(reply) => self.pending = Some(reply),
            Outcome::HangUp => self.hung_up = true,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for MockSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let latency = self.keystore.lock().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if self.hung_up {
            return Ok(0);
        }
        match self.pending.take() {
            Some(reply) => {
                let n = reply.len().min(buf.len());
                buf[..n].copy_from_slice(&reply[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::TimedOut, "no response pending")),
        }
    }
}

fn valid_blocks(payload: &[u8]) -> bool {
    crate::wire::check_block_payload(payload).is_ok()
}

fn transform(key: &[u8; 16], payload: &[u8]) -> Vec<u8> {
    let pad = blake3::keyed_hash(&blake3::hash(key).into(), b"kslink-mock-block");
    payload
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ pad.as_bytes()[i % 16])
        .collect()
}
