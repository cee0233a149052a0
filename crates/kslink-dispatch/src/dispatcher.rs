//! Keystore registry and the per-keystore worker threads.
//!
//! Each registered keystore owns a FIFO queue and, once started, one worker
//! thread that holds its [`KeystoreLink`]. The link is moved into the thread
//! on start and handed back when the thread is joined, so a stopped keystore
//! can be started again.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use kslink_core::config::ClientConfig;
use kslink_core::{Endpoint, KeystoreError, KeystoreResult, KslinkConfig};
use kslink_link::KeystoreLink;

use crate::command::Command;
use crate::request::{completion_queue, Request};

/// How long a worker waits on its queue before re-checking the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

enum Worker {
    Idle {
        link: KeystoreLink,
        queue: Receiver<Request>,
    },
    Running {
        running: Arc<AtomicBool>,
        handle: JoinHandle<(KeystoreLink, Receiver<Request>)>,
    },
    /// The worker thread panicked and took the link with it.
    Lost,
}

struct Slot {
    sender: Sender<Request>,
    worker: Mutex<Worker>,
}

impl Slot {
    fn start(&self, name: &str) -> KeystoreResult<()> {
        let mut worker = self.worker.lock().unwrap();
        match mem::replace(&mut *worker, Worker::Lost) {
            Worker::Idle { mut link, queue } => {
                if let Err(e) = link.connect() {
                    *worker = Worker::Idle { link, queue };
                    return Err(e);
                }
                let running = Arc::new(AtomicBool::new(true));
                let flag = Arc::clone(&running);
                let spawned = thread::Builder::new()
                    .name(format!("kslink-{name}"))
                    .spawn(move || worker_loop(link, queue, flag));
                let handle = match spawned {
                    Ok(handle) => handle,
                    Err(e) => {
                        // The link and queue went down with the unspawned closure,
                        // so the slot stays Lost and cannot be started again.
                        error!(keystore = %name, error = %e, "spawning worker thread failed");
                        return Err(KeystoreError::Connection {
                            keystore: name.to_string(),
                            reason: format!("spawning worker thread: {e}"),
                        });
                    }
                };
                *worker = Worker::Running { running, handle };
                info!(keystore = %name, "worker started");
                Ok(())
            }
            running @ Worker::Running { .. } => {
                *worker = running;
                Ok(())
            }
            Worker::Lost => Err(KeystoreError::WorkerStopped(name.to_string())),
        }
    }

    fn signal_stop(&self) {
        if let Worker::Running { running, .. } = &*self.worker.lock().unwrap() {
            running.store(false, Ordering::Release);
        }
    }

    fn stop(&self, name: &str) {
        let mut worker = self.worker.lock().unwrap();
        let (mut link, queue) = match mem::replace(&mut *worker, Worker::Lost) {
            Worker::Idle { link, queue } => (link, queue),
            Worker::Running { running, handle } => {
                running.store(false, Ordering::Release);
                match handle.join() {
                    Ok(parts) => parts,
                    Err(_) => {
                        error!(keystore = %name, "worker thread panicked");
                        return;
                    }
                }
            }
            Worker::Lost => return,
        };

        let mut drained = 0usize;
        while let Ok(request) = queue.try_recv() {
            request.abandon(KeystoreError::WorkerStopped(name.to_string()));
            drained += 1;
        }
        if drained > 0 {
            warn!(keystore = %name, drained, "failed queued requests at stop");
        }
        if let Err(e) = link.close() {
            debug!(keystore = %name, error = %e, "close after stop failed");
        }
        *worker = Worker::Idle { link, queue };
    }

    fn is_running(&self) -> bool {
        matches!(*self.worker.lock().unwrap(), Worker::Running { .. })
    }
}

fn worker_loop(
    mut link: KeystoreLink,
    queue: Receiver<Request>,
    running: Arc<AtomicBool>,
) -> (KeystoreLink, Receiver<Request>) {
    while running.load(Ordering::Acquire) {
        match queue.recv_timeout(POLL_INTERVAL) {
            Ok(request) => request.execute(&mut link),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(keystore = %link.servername(), "worker exiting");
    (link, queue)
}

/// Routes requests to per-keystore workers. Share it behind an `Arc`.
pub struct Dispatcher {
    client: ClientConfig,
    slots: RwLock<HashMap<String, Slot>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Dispatcher {
    /// `client` supplies timeouts and the reconnect policy for links built by
    /// [`register`](Self::register).
    pub fn new(client: ClientConfig) -> Self {
        Self {
            client,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Register every keystore listed in the configuration.
    pub fn from_config(config: &KslinkConfig) -> KeystoreResult<Self> {
        let dispatcher = Self::new(config.client.clone());
        for endpoint in config.endpoints()? {
            dispatcher.register_link(KeystoreLink::tls(endpoint, &config.client))?;
        }
        Ok(dispatcher)
    }

    /// Register a keystore reached over PSK-TLS.
    pub fn register(
        &self,
        hostname: &str,
        port: u16,
        servername: &str,
        psk: Vec<u8>,
    ) -> KeystoreResult<()> {
        let endpoint = Endpoint::new(hostname, port, servername, psk);
        self.register_link(KeystoreLink::tls(endpoint, &self.client))
    }

    /// Register a pre-built link, keyed by its servername.
    pub fn register_link(&self, link: KeystoreLink) -> KeystoreResult<()> {
        let name = link.servername().to_string();
        let mut slots = self.slots.write().unwrap();
        if slots.contains_key(&name) {
            return Err(KeystoreError::Config(format!(
                "keystore {name} registered twice"
            )));
        }
        let (sender, queue) = mpsc::channel();
        slots.insert(
            name.clone(),
            Slot {
                sender,
                worker: Mutex::new(Worker::Idle { link, queue }),
            },
        );
        debug!(keystore = %name, "registered");
        Ok(())
    }

    /// Connect and start a worker for every registered keystore not yet
    /// running. Returns the keystores that failed to connect; they stay
    /// registered and their queued requests wait for a later start.
    pub fn start_all(&self) -> Vec<(String, KeystoreError)> {
        let slots = self.slots.read().unwrap();
        let mut failures = Vec::new();
        for (name, slot) in slots.iter() {
            if let Err(e) = slot.start(name) {
                warn!(keystore = %name, error = %e, "keystore failed to start");
                failures.push((name.clone(), e));
            }
        }
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        failures
    }

    /// Queue `request` for its keystore. Never blocks.
    pub fn dispatch(&self, request: &Request) -> KeystoreResult<()> {
        let slots = self.slots.read().unwrap();
        let slot = slots
            .get(request.keystore())
            .ok_or_else(|| KeystoreError::Lookup(request.keystore().to_string()))?;
        slot.sender
            .send(request.clone())
            .map_err(|_| KeystoreError::WorkerStopped(request.keystore().to_string()))
    }

    /// Stop every worker, fail whatever is still queued, close the links.
    /// Safe to call repeatedly and from any thread.
    ///
    /// Keystores are stopped in parallel, so an idle one is closed without
    /// waiting on a busy one. The call itself returns only once every
    /// in-flight command has finished, which is bounded by the link I/O
    /// timeout (unbounded when `io_timeout_secs = 0`).
    pub fn stop_all(&self) {
        let slots = self.slots.read().unwrap();
        for slot in slots.values() {
            slot.signal_stop();
        }
        thread::scope(|scope| {
            for (name, slot) in slots.iter() {
                scope.spawn(move || slot.stop(name));
            }
        });
    }

    /// Registered servernames, sorted.
    pub fn keystores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_running(&self, keystore: &str) -> bool {
        self.slots
            .read()
            .unwrap()
            .get(keystore)
            .is_some_and(Slot::is_running)
    }

    /// Send one command to each listed keystore and return the first success
    /// as `(keystore, bytes)`. Fails with the last error once every request
    /// has failed, or with `Timeout` if none succeeded in time. A timeout too
    /// large to form a deadline (e.g. `Duration::MAX`) waits without bound.
    pub fn race(
        &self,
        targets: Vec<(String, Command)>,
        timeout: Duration,
    ) -> KeystoreResult<(String, Vec<u8>)> {
        if targets.is_empty() {
            return Err(KeystoreError::input("race needs at least one keystore"));
        }
        let deadline = Instant::now().checked_add(timeout);
        let (tx, rx) = completion_queue();

        let mut in_flight = 0usize;
        let mut last_err = None;
        for (keystore, command) in targets {
            let request = Request::with_completion(keystore, command, tx.clone());
            match self.dispatch(&request) {
                Ok(()) => in_flight += 1,
                Err(e) => last_err = Some(e),
            }
        }

        // every live request holds its own sender
        drop(tx);

        while in_flight > 0 {
            let received = match deadline {
                Some(deadline) => rx
                    .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                    .map_err(|e| match e {
                        RecvTimeoutError::Timeout => KeystoreError::Timeout(timeout),
                        RecvTimeoutError::Disconnected => {
                            last_err.clone().unwrap_or(KeystoreError::Timeout(timeout))
                        }
                    }),
                None => rx
                    .recv()
                    .map_err(|_| last_err.clone().unwrap_or(KeystoreError::Timeout(timeout))),
            };
            let done = received?;
            in_flight -= 1;
            match done.get_response(Some(Duration::ZERO)) {
                Ok(bytes) => {
                    debug!(keystore = %done.keystore(), "race won");
                    return Ok((done.keystore().to_string(), bytes));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(KeystoreError::Timeout(timeout)))
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop_all();
    }
}
