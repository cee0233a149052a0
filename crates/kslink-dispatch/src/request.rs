//! Deferred keystore calls with a single-assignment completion cell.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use kslink_core::{KeystoreError, KeystoreResult};
use kslink_link::KeystoreLink;

use crate::command::Command;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Create a completion queue. Requests built with the sender are pushed onto
/// it once they reach a terminal state, whatever the outcome.
pub fn completion_queue() -> (Sender<Request>, Receiver<Request>) {
    mpsc::channel()
}

enum State {
    Pending,
    /// May hold key material (unwrapped keys), wiped when the request drops
    Resolved(Zeroizing<Vec<u8>>),
    Failed(KeystoreError),
}

struct Inner {
    id: u64,
    keystore: String,
    operation: &'static str,
    command: Mutex<Option<Command>>,
    state: Mutex<State>,
    done: Condvar,
    completion: Option<Sender<Request>>,
}

/// A command bound to one keystore. Cloning yields another handle to the
/// same request.
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

impl Request {
    pub fn new(keystore: impl Into<String>, command: Command) -> Self {
        Self::build(keystore.into(), command, None)
    }

    pub fn with_completion(
        keystore: impl Into<String>,
        command: Command,
        queue: Sender<Request>,
    ) -> Self {
        Self::build(keystore.into(), command, Some(queue))
    }

    fn build(keystore: String, command: Command, completion: Option<Sender<Request>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                keystore,
                operation: command.name(),
                command: Mutex::new(Some(command)),
                state: Mutex::new(State::Pending),
                done: Condvar::new(),
                completion,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Target keystore servername, used for routing.
    pub fn keystore(&self) -> &str {
        &self.inner.keystore
    }

    pub fn operation(&self) -> &'static str {
        self.inner.operation
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.inner.state.lock().unwrap(), State::Pending)
    }

    /// Run the bound command against `link` and record the outcome.
    /// Only the first call does anything.
    pub fn execute(&self, link: &mut KeystoreLink) {
        let Some(command) = self.inner.command.lock().unwrap().take() else {
            return;
        };
        let result = command.run(link);
        match &result {
            Ok(bytes) => debug!(
                keystore = %self.inner.keystore,
                request = self.inner.id,
                op = self.inner.operation,
                bytes = bytes.len(),
                "request resolved"
            ),
            Err(e) => warn!(
                keystore = %self.inner.keystore,
                request = self.inner.id,
                op = self.inner.operation,
                error = %e,
                "request failed"
            ),
        }
        self.complete(result);
    }

    /// Fail a request that will never run. No-op if it already ran.
    pub(crate) fn abandon(&self, error: KeystoreError) {
        if self.inner.command.lock().unwrap().take().is_some() {
            self.complete(Err(error));
        }
    }

    fn complete(&self, result: KeystoreResult<Vec<u8>>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if !matches!(*state, State::Pending) {
                return;
            }
            *state = match result {
                Ok(bytes) => State::Resolved(Zeroizing::new(bytes)),
                Err(e) => State::Failed(e),
            };
        }
        self.inner.done.notify_all();

        if let Some(queue) = &self.inner.completion {
            // the receiver may have gone away (e.g. a race already decided)
            let _ = queue.send(self.clone());
        }
    }

    /// Block until the request is resolved or failed. `None` waits forever.
    pub fn get_response(&self, timeout: Option<Duration>) -> KeystoreResult<Vec<u8>> {
        let state = self.inner.state.lock().unwrap();
        let pending = |s: &mut State| matches!(s, State::Pending);
        let state = match timeout {
            None => self.inner.done.wait_while(state, pending).unwrap(),
            Some(limit) => self.inner.done.wait_timeout_while(state, limit, pending).unwrap().0,
        };
        match &*state {
            State::Resolved(bytes) => Ok(bytes.to_vec()),
            State::Failed(e) => Err(e.clone()),
            State::Pending => Err(KeystoreError::Timeout(timeout.unwrap_or_default())),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.inner.state.lock().unwrap() {
            State::Pending => "pending",
            State::Resolved(_) => "resolved",
            State::Failed(_) => "failed",
        };
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("keystore", &self.inner.keystore)
            .field("operation", &self.inner.operation)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use kslink_core::{Endpoint, RecordIndex};
    use kslink_link::mock::{MockKeystore, ScriptedConnector};

    fn mock_link(keystore: &MockKeystore) -> KeystoreLink {
        let endpoint = Endpoint::new("127.0.0.1", 1, "key17.com", vec![1; 32]);
        KeystoreLink::new(endpoint, Arc::new(keystore.clone()))
    }

    #[test]
    fn pending_request_times_out() {
        let request = Request::new("key17.com", Command::Echo("ping".into()));
        let err = request
            .get_response(Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, KeystoreError::Timeout(_)));
        assert!(!request.is_done());
    }

    #[test]
    fn execute_resolves_and_response_is_repeatable() {
        let keystore = MockKeystore::new("key17.com").with_record(1, b"48656c6c6f");
        let mut link = mock_link(&keystore);
        let request = Request::new("key17.com", Command::ReadRecord(RecordIndex::new(1).unwrap()));

        request.execute(&mut link);

        assert_eq!(request.get_response(None).unwrap(), b"48656c6c6f");
        assert_eq!(request.get_response(Some(Duration::ZERO)).unwrap(), b"48656c6c6f");
    }

    #[test]
    fn second_execute_is_noop() {
        let keystore = MockKeystore::new("key17.com");
        let mut link = mock_link(&keystore);
        let request = Request::new("key17.com", Command::Echo("hi".into()));

        request.execute(&mut link);
        request.execute(&mut link);

        assert_eq!(keystore.commands(), vec!["?01"]);
    }

    #[test]
    fn failure_is_stored_and_cloned_to_every_reader() {
        let connector = ScriptedConnector::new();
        connector.reply(&b"ERROR bad index"[..]);
        let endpoint = Endpoint::new("127.0.0.1", 1, "key17.com", vec![1; 32]);
        let mut link = KeystoreLink::new(endpoint, Arc::new(connector));
        let request = Request::new(
            "key17.com",
            Command::WriteRecord {
                index: RecordIndex::new(5).unwrap(),
                data: vec![1, 2],
            },
        );

        request.execute(&mut link);

        for _ in 0..2 {
            assert!(matches!(
                request.get_response(None),
                Err(KeystoreError::Protocol { .. })
            ));
        }
    }

    #[test]
    fn waiter_wakes_when_another_thread_executes() {
        let keystore = MockKeystore::new("key17.com");
        let request = Request::new("key17.com", Command::Echo("x".into()));

        let worker = {
            let request = request.clone();
            let mut link = mock_link(&keystore);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                request.execute(&mut link);
            })
        };

        assert_eq!(request.get_response(Some(Duration::from_secs(5))).unwrap(), b"");
        worker.join().unwrap();
    }

    #[test]
    fn completion_queue_receives_terminal_request() {
        let (tx, rx) = completion_queue();
        let keystore = MockKeystore::new("key17.com");
        let mut link = mock_link(&keystore);
        let request = Request::with_completion("key17.com", Command::Echo("x".into()), tx);

        request.execute(&mut link);

        let done = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(done.id(), request.id());
        assert!(done.is_done());
    }

    #[test]
    fn abandoned_request_fails_and_never_runs() {
        let keystore = MockKeystore::new("key17.com");
        let mut link = mock_link(&keystore);
        let request = Request::new("key17.com", Command::Echo("x".into()));

        request.abandon(KeystoreError::WorkerStopped("key17.com".into()));
        request.execute(&mut link);

        assert!(matches!(
            request.get_response(None),
            Err(KeystoreError::WorkerStopped(_))
        ));
        assert!(keystore.commands().is_empty());
    }

    #[test]
    fn resolved_bytes_are_held_in_a_wiping_buffer() {
        let keystore = MockKeystore::new("key17.com").with_record(0, b"secret");
        let mut link = mock_link(&keystore);
        let request = Request::new("key17.com", Command::ReadRecord(RecordIndex::new(0).unwrap()));

        request.execute(&mut link);

        match &*request.inner.state.lock().unwrap() {
            State::Resolved(bytes) => {
                let held: &Zeroizing<Vec<u8>> = bytes;
                assert_eq!(held.as_slice(), b"secret");
            }
            _ => panic!("request should be resolved"),
        }
        assert_eq!(request.get_response(None).unwrap(), b"secret");
    }
}
