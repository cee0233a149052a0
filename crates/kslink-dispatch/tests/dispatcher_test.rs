//! Dispatcher, worker and relay behaviour against emulated keystores.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kslink_core::{ContentKey, Endpoint, KeyIndex, KeystoreError, KslinkConfig, RecordIndex};
use kslink_dispatch::relay;
use kslink_dispatch::{completion_queue, Command, Dispatcher, KekProvider, Request, RoutedCipher};
use kslink_link::mock::MockKeystore;
use kslink_link::KeystoreLink;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn register(dispatcher: &Dispatcher, keystore: &MockKeystore, name: &str) {
    let endpoint = Endpoint::new("127.0.0.1", 4433, name, vec![0x33; 32]);
    dispatcher
        .register_link(KeystoreLink::new(endpoint, Arc::new(keystore.clone())))
        .unwrap();
}

fn read(index: i64) -> Command {
    Command::ReadRecord(RecordIndex::new(index).unwrap())
}

#[test]
fn read_record_through_worker() {
    let dispatcher = Dispatcher::default();
    let keystore = MockKeystore::new("key17.com").with_record(1, b"48656c6c6f");
    register(&dispatcher, &keystore, "key17.com");
    assert!(dispatcher.start_all().is_empty());

    let request = Request::new("key17.com", read(1));
    dispatcher.dispatch(&request).unwrap();

    assert_eq!(request.get_response(WAIT).unwrap(), b"48656c6c6f");
    dispatcher.stop_all();
}

#[test]
fn unregistered_keystore_never_executes() {
    let dispatcher = Dispatcher::default();
    let keystore = MockKeystore::new("key17.com");
    register(&dispatcher, &keystore, "key17.com");
    dispatcher.start_all();

    let request = Request::new("key18.com", Command::Echo("hello".into()));
    assert!(matches!(
        dispatcher.dispatch(&request),
        Err(KeystoreError::Lookup(_))
    ));
    assert!(matches!(
        request.get_response(Some(Duration::from_millis(20))),
        Err(KeystoreError::Timeout(_))
    ));
    assert!(keystore.commands().is_empty());
}

#[test]
fn unstarted_keystore_times_out() {
    let dispatcher = Dispatcher::default();
    let keystore = MockKeystore::new("key17.com");
    register(&dispatcher, &keystore, "key17.com");

    let request = Request::new("key17.com", Command::Echo("hello".into()));
    dispatcher.dispatch(&request).unwrap();

    assert!(matches!(
        request.get_response(Some(Duration::from_millis(100))),
        Err(KeystoreError::Timeout(_))
    ));
    assert_eq!(keystore.connects(), 0);
}

#[test]
fn shared_completion_queue_first_responder_wins() {
    let dispatcher = Dispatcher::default();
    let fast = MockKeystore::new("key17.com").with_record(0, b"fast");
    let slow = MockKeystore::new("key18.com")
        .with_record(0, b"slow")
        .with_latency(Duration::from_millis(150));
    register(&dispatcher, &fast, "key17.com");
    register(&dispatcher, &slow, "key18.com");
    assert!(dispatcher.start_all().is_empty());

    let (tx, rx) = completion_queue();
    let a = Request::with_completion("key18.com", read(0), tx.clone());
    let b = Request::with_completion("key17.com", read(0), tx);
    dispatcher.dispatch(&a).unwrap();
    dispatcher.dispatch(&b).unwrap();

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first.keystore(), "key17.com");
    assert_eq!(first.get_response(None).unwrap(), b"fast");

    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(second.id(), a.id());
    assert_eq!(a.get_response(WAIT).unwrap(), b"slow");
}

#[test]
fn worker_survives_failed_command() {
    let dispatcher = Dispatcher::default();
    let keystore = MockKeystore::new("key17.com").with_record(3, b"ok");
    register(&dispatcher, &keystore, "key17.com");
    dispatcher.start_all();

    let empty = Request::new("key17.com", read(4));
    let full = Request::new("key17.com", read(3));
    dispatcher.dispatch(&empty).unwrap();
    dispatcher.dispatch(&full).unwrap();

    assert!(matches!(
        empty.get_response(WAIT),
        Err(KeystoreError::Protocol { .. })
    ));
    assert_eq!(full.get_response(WAIT).unwrap(), b"ok");
    assert!(dispatcher.is_running("key17.com"));
}

#[test]
fn idle_close_is_recovered_by_worker() {
    let dispatcher = Dispatcher::default();
    let keystore = MockKeystore::new("key17.com").with_record(0, b"v");
    register(&dispatcher, &keystore, "key17.com");
    dispatcher.start_all();

    keystore.expire_sessions();
    let request = Request::new("key17.com", read(0));
    dispatcher.dispatch(&request).unwrap();

    assert_eq!(request.get_response(WAIT).unwrap(), b"v");
    assert_eq!(keystore.connects(), 2);
}

#[test]
fn stop_all_drains_queue_and_is_idempotent() {
    let dispatcher = Dispatcher::default();
    let keystore = MockKeystore::new("key17.com")
        .with_record(0, b"v")
        .with_latency(Duration::from_millis(200));
    register(&dispatcher, &keystore, "key17.com");
    dispatcher.start_all();

    let in_flight = Request::new("key17.com", read(0));
    let queued: Vec<Request> = (0..3)
        .map(|_| Request::new("key17.com", read(0)))
        .collect();
    dispatcher.dispatch(&in_flight).unwrap();
    thread::sleep(Duration::from_millis(50));
    for request in &queued {
        dispatcher.dispatch(request).unwrap();
    }

    dispatcher.stop_all();
    dispatcher.stop_all();

    assert_eq!(in_flight.get_response(WAIT).unwrap(), b"v");
    for request in &queued {
        assert!(matches!(
            request.get_response(WAIT),
            Err(KeystoreError::WorkerStopped(_))
        ));
    }
    assert!(!dispatcher.is_running("key17.com"));
    assert_eq!(keystore.commands().last().map(String::as_str), Some("?02"));
}

#[test]
fn stopped_keystore_can_start_again() {
    let dispatcher = Dispatcher::default();
    let keystore = MockKeystore::new("key17.com").with_record(0, b"again");
    register(&dispatcher, &keystore, "key17.com");
    dispatcher.start_all();
    dispatcher.stop_all();

    assert!(dispatcher.start_all().is_empty());
    let request = Request::new("key17.com", read(0));
    dispatcher.dispatch(&request).unwrap();
    assert_eq!(request.get_response(WAIT).unwrap(), b"again");
}

#[test]
fn stop_all_from_many_threads() {
    let dispatcher = Arc::new(Dispatcher::default());
    for name in ["key1.com", "key2.com"] {
        register(&dispatcher, &MockKeystore::new(name), name);
    }
    dispatcher.start_all();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.stop_all())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(!dispatcher.is_running("key1.com"));
    assert!(!dispatcher.is_running("key2.com"));
}

#[test]
fn race_returns_fastest_success() {
    let dispatcher = Dispatcher::default();
    let slow = MockKeystore::new("key17.com")
        .with_record(0, b"slow")
        .with_latency(Duration::from_millis(150));
    let fast = MockKeystore::new("key18.com").with_record(0, b"fast");
    register(&dispatcher, &slow, "key17.com");
    register(&dispatcher, &fast, "key18.com");
    dispatcher.start_all();

    let (winner, bytes) = dispatcher
        .race(
            vec![
                ("key17.com".into(), read(0)),
                ("key18.com".into(), read(0)),
                ("key99.com".into(), read(0)),
            ],
            Duration::from_secs(5),
        )
        .unwrap();

    assert_eq!(winner, "key18.com");
    assert_eq!(bytes, b"fast");
}

#[test]
fn race_skips_failures_and_reports_last_error() {
    let dispatcher = Dispatcher::default();
    let empty = MockKeystore::new("key17.com");
    let full = MockKeystore::new("key18.com")
        .with_record(0, b"found")
        .with_latency(Duration::from_millis(50));
    register(&dispatcher, &empty, "key17.com");
    register(&dispatcher, &full, "key18.com");
    dispatcher.start_all();

    let (winner, _) = dispatcher
        .race(
            vec![
                ("key17.com".into(), read(0)),
                ("key18.com".into(), read(0)),
            ],
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(winner, "key18.com");

    let err = dispatcher
        .race(
            vec![("key17.com".into(), read(0))],
            Duration::from_secs(5),
        )
        .unwrap_err();
    assert!(matches!(err, KeystoreError::Protocol { .. }));
}

#[test]
fn race_without_deadline_waits_for_winner() {
    let dispatcher = Dispatcher::default();
    let keystore = MockKeystore::new("key17.com")
        .with_record(0, b"late")
        .with_latency(Duration::from_millis(50));
    register(&dispatcher, &keystore, "key17.com");
    dispatcher.start_all();

    let (winner, bytes) = dispatcher
        .race(vec![("key17.com".into(), read(0))], Duration::MAX)
        .unwrap();

    assert_eq!(winner, "key17.com");
    assert_eq!(bytes, b"late");
}

#[test]
fn race_times_out_when_nobody_answers() {
    let dispatcher = Dispatcher::default();
    let keystore = MockKeystore::new("key17.com").with_record(0, b"v");
    register(&dispatcher, &keystore, "key17.com");

    let err = dispatcher
        .race(
            vec![("key17.com".into(), read(0))],
            Duration::from_millis(100),
        )
        .unwrap_err();

    assert!(matches!(err, KeystoreError::Timeout(_)));
    assert!(keystore.commands().is_empty());
}

#[test]
fn stop_all_closes_idle_keystore_while_another_is_busy() {
    let dispatcher = Arc::new(Dispatcher::default());
    let idle = MockKeystore::new("key17.com");
    let busy = MockKeystore::new("key18.com")
        .with_record(0, b"v")
        .with_latency(Duration::from_millis(1500));
    register(&dispatcher, &idle, "key17.com");
    register(&dispatcher, &busy, "key18.com");
    assert!(dispatcher.start_all().is_empty());

    let in_flight = Request::new("key18.com", read(0));
    dispatcher.dispatch(&in_flight).unwrap();
    thread::sleep(Duration::from_millis(50));

    let stopper = {
        let dispatcher = Arc::clone(&dispatcher);
        thread::spawn(move || dispatcher.stop_all())
    };
    thread::sleep(Duration::from_millis(600));

    assert_eq!(idle.commands().last().map(String::as_str), Some("?02"));
    assert!(!in_flight.is_done());

    stopper.join().unwrap();
    assert_eq!(in_flight.get_response(WAIT).unwrap(), b"v");
    assert!(!dispatcher.is_running("key18.com"));
}

#[test]
fn kek_provider_roundtrip() {
    let dispatcher = Arc::new(Dispatcher::default());
    let keystore = MockKeystore::new("key17.com");
    register(&dispatcher, &keystore, "key17.com");
    dispatcher.start_all();

    let kek = KekProvider::new(Arc::clone(&dispatcher), "key17.com", KeyIndex::new(3).unwrap())
        .with_timeout(WAIT);
    let key = ContentKey::from_bytes([0x5c; 32]);

    let wrapped = kek.wrap_key(&key).unwrap();
    let recovered = kek.unwrap_key(&wrapped).unwrap();

    assert_eq!(recovered.as_bytes(), key.as_bytes());
    assert_eq!(keystore.commands(), vec!["Ac", "Ac", "Ac", "Ac"]);
}

#[test]
fn routed_cipher_matches_worker_side_wrap() {
    let dispatcher = Arc::new(Dispatcher::default());
    let keystore = MockKeystore::new("key17.com");
    register(&dispatcher, &keystore, "key17.com");
    dispatcher.start_all();

    let index = KeyIndex::new(1).unwrap();
    let key = ContentKey::from_bytes([0xa7; 32]);
    let mut cipher = RoutedCipher::new(&dispatcher, "key17.com").with_timeout(WAIT);
    let wrapped = kslink_wrap::wrap(&mut cipher, index, &key).unwrap();

    let kek = KekProvider::new(Arc::clone(&dispatcher), "key17.com", index).with_timeout(WAIT);
    assert_eq!(kek.unwrap_key(&wrapped).unwrap().as_bytes(), key.as_bytes());

    let recovered = kslink_wrap::unwrap(&mut cipher, index, &wrapped).unwrap();
    assert_eq!(recovered.as_bytes(), key.as_bytes());
}

#[test]
fn routed_cipher_reports_unregistered_keystore() {
    let dispatcher = Dispatcher::default();
    let mut cipher = RoutedCipher::new(&dispatcher, "key99.com");
    let err = kslink_wrap::wrap(&mut cipher, KeyIndex::new(0).unwrap(), &ContentKey::from_bytes([1; 32]))
        .unwrap_err();
    assert!(matches!(err, KeystoreError::Lookup(_)));
}

#[test]
fn relay_frame_end_to_end() {
    let dispatcher = Dispatcher::default();
    let keystore = MockKeystore::new("key17.com").with_record(1, b"48656c6c6f");
    register(&dispatcher, &keystore, "key17.com");
    dispatcher.start_all();

    let reply = relay::handle(&dispatcher, &[0x00, 17, 1], WAIT);
    assert_eq!(reply[0], 0x00);
    assert_eq!(&reply[1..], b"48656c6c6f");

    let mut wrap = vec![0x03, 17, 0];
    wrap.extend_from_slice(&[0x11; 32]);
    let reply = relay::handle(&dispatcher, &wrap, WAIT);
    assert_eq!(reply.len(), 1 + 48);

    let mut unwrap = vec![0x04, 17, 0];
    unwrap.extend_from_slice(&reply[1..]);
    let reply = relay::handle(&dispatcher, &unwrap, WAIT);
    assert_eq!(&reply[1..], &[0x11; 32]);

    assert_eq!(relay::handle(&dispatcher, &[0x07, 17, 0], WAIT), b"01");
}

#[test]
fn from_config_registers_without_connecting() {
    let config = KslinkConfig::parse(
        r#"
[servers.lab]
host = "127.0.0.1"
port = 4433

[[servers.lab.keystores]]
servername = "key17.com"
psk = "00112233445566778899aabbccddeeff"

[[servers.lab.keystores]]
servername = "key18.com"
psk = "ffeeddccbbaa99887766554433221100"
"#,
    )
    .unwrap();

    let dispatcher = Dispatcher::from_config(&config).unwrap();

    assert_eq!(dispatcher.keystores(), vec!["key17.com", "key18.com"]);
    assert!(!dispatcher.is_running("key17.com"));
}
