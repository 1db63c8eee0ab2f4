//! Integration tests for the consumer coordinator: RDY credit, backoff,
//! reconnection and shutdown against scripted brokers.

mod common;

use async_trait::async_trait;
use common::{wait_until, FakeBroker, Script};
use quay_core::backoff::BackoffPolicy;
use quay_core::endpoint::Address;
use quay_core::error::QuayError;
use quay_nsq::config::{ConnectionConfig, ReaderConfig};
use quay_nsq::discovery::Discovery;
use quay_nsq::identify::IdentifyOptions;
use quay_nsq::message::Message;
use quay_nsq::reader::{Handler, Outcome, Reader};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

/// Completes each message once the test opens the gate for it.
struct Gated {
    gate: flume::Receiver<()>,
    seen: Rc<Cell<u64>>,
}

#[async_trait(?Send)]
impl Handler for Gated {
    async fn handle(&self, _message: &Message) -> Outcome {
        self.seen.set(self.seen.get() + 1);
        let _ = self.gate.recv_async().await;
        Outcome::Completed
    }
}

/// Counts handled messages, gives up and connection failures.
#[derive(Default, Clone)]
struct Recorder {
    handled: Rc<RefCell<Vec<String>>>,
    gave_up: Rc<Cell<u32>>,
    failures: Rc<RefCell<Vec<String>>>,
    fail: bool,
    /// Fail only messages with this body.
    fail_body: Option<&'static str>,
}

#[async_trait(?Send)]
impl Handler for Recorder {
    async fn handle(&self, message: &Message) -> Outcome {
        self.handled
            .borrow_mut()
            .push(String::from_utf8_lossy(&message.body).into_owned());
        if self.fail || self.fail_body.is_some_and(|b| b.as_bytes() == &message.body[..]) {
            Outcome::Unhandled
        } else {
            Outcome::Completed
        }
    }

    fn giving_up(&self, _message: &Message) {
        self.gave_up.set(self.gave_up.get() + 1);
    }

    fn connection_failed(&self, _address: &Address, error: &QuayError) {
        let kind = match error {
            QuayError::Auth(_) => "auth".to_string(),
            QuayError::HeartbeatTimeout(_) => "heartbeat".to_string(),
            other => other.to_string(),
        };
        self.failures.borrow_mut().push(kind);
    }
}

/// Answers lookups from a list the test edits; `None` fails the lookup.
#[derive(Clone, Default)]
struct Scripted {
    answer: Rc<RefCell<Option<Vec<Address>>>>,
    lookups: Rc<Cell<u32>>,
}

#[async_trait(?Send)]
impl Discovery for Scripted {
    async fn lookup(&self, _topic: &str) -> quay_core::error::Result<Vec<Address>> {
        self.lookups.set(self.lookups.get() + 1);
        self.answer
            .borrow()
            .clone()
            .ok_or_else(|| QuayError::protocol("lookup service unavailable"))
    }
}

fn fast_config() -> ReaderConfig {
    ReaderConfig::default()
        .with_redistribute_interval(Duration::from_millis(50))
        .with_reconnect_interval(Duration::from_millis(50), Duration::from_millis(200))
        .with_close_timeout(Duration::from_secs(2))
}

#[compio::test]
async fn test_max_in_flight_caps_deliveries() {
    let broker = FakeBroker::start(Script::default()).await;
    for i in 0..10 {
        broker.push(0, &format!("m{i}"));
    }

    let (gate_tx, gate) = flume::unbounded();
    let seen = Rc::new(Cell::new(0));
    let reader = Reader::start(
        [broker.address.clone()],
        "events",
        "archive",
        Gated {
            gate,
            seen: seen.clone(),
        },
        fast_config().with_max_in_flight(5),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(2), || broker.log().delivered == 5).await);
    compio::time::sleep(Duration::from_millis(200)).await;
    {
        let log = broker.log();
        assert_eq!(log.delivered, 5, "no sixth message before a FIN");
        assert_eq!(log.peak_in_flight, 5);
        assert_eq!(log.rdy, vec![5]);
    }
    assert_eq!(seen.get(), 5);
    assert_eq!(reader.stats().in_flight, 5);
    assert!(reader.is_starved());

    for _ in 0..10 {
        gate_tx.send(()).unwrap();
    }
    assert!(wait_until(Duration::from_secs(3), || broker.log().finished.len() == 10).await);
    assert!(broker.log().peak_in_flight <= 5);
    assert_eq!(reader.stats().finished, 10);

    reader.close().await.unwrap();
    assert_eq!(broker.log().count("CLS"), 1);
}

#[compio::test]
async fn test_failing_handler_backs_off_to_single_trial() {
    let broker = FakeBroker::start(Script {
        redeliver: true,
        ..Script::default()
    })
    .await;
    for i in 0..20 {
        broker.push(0, &format!("m{i}"));
    }

    let handler = Recorder {
        fail: true,
        ..Recorder::default()
    };
    let backoff = BackoffPolicy::default()
        .with_base_delay(Duration::from_millis(20))
        .with_max_delay(Duration::from_millis(80));
    let reader = Reader::start(
        [broker.address.clone()],
        "events",
        "archive",
        handler.clone(),
        fast_config()
            .with_max_in_flight(10)
            .with_requeue_delay(Duration::from_millis(1))
            .with_backoff(backoff),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || broker.log().requeued.len() >= 15).await);
    assert!(reader.stats().backoff_level > 0);

    {
        let log = broker.log();
        assert_eq!(log.rdy.first(), Some(&10));
        let entered = log
            .rdy
            .iter()
            .position(|&n| n == 0)
            .expect("backoff never withdrew credit");
        let after = &log.rdy[entered..];
        assert!(after.iter().all(|&n| n <= 1), "RDY grew during backoff: {:?}", log.rdy);
        assert!(after.contains(&1), "backoff never retried: {:?}", log.rdy);
    }

    reader.close().await.unwrap();
}

#[compio::test]
async fn test_reconnects_after_heartbeat_timeout() {
    let broker = FakeBroker::start(Script::default()).await;

    let identify = IdentifyOptions::default().with_heartbeat_interval(Some(Duration::from_millis(150)));
    let handler = Recorder::default();
    let reader = Reader::start(
        [broker.address.clone()],
        "events",
        "archive",
        handler.clone(),
        fast_config().with_connection(ConnectionConfig::default().with_identify(identify)),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(4), || broker.log().connections >= 2).await);
    assert!(handler.failures.borrow().iter().any(|f| f == "heartbeat"));

    reader.close().await.unwrap();
}

#[compio::test]
async fn test_unauthorized_subscribe_is_not_retried() {
    let broker = FakeBroker::start(Script {
        sub_error: Some("E_UNAUTHORIZED AUTH no permission for topic"),
        ..Script::default()
    })
    .await;

    let handler = Recorder::default();
    let reader = Reader::start(
        [broker.address.clone()],
        "events",
        "archive",
        handler.clone(),
        fast_config(),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(2), || !handler.failures.borrow().is_empty()).await);
    compio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(broker.log().connections, 1);
    assert_eq!(*handler.failures.borrow(), vec!["auth".to_string()]);
    assert_eq!(reader.stats().connections, 0);

    reader.close().await.unwrap();
}

#[compio::test]
async fn test_gives_up_after_max_attempts() {
    let broker = FakeBroker::start(Script::default()).await;
    broker.push(5, "poison");
    broker.push(0, "fine");

    let handler = Recorder::default();
    let reader = Reader::start(
        [broker.address.clone()],
        "events",
        "archive",
        handler.clone(),
        fast_config().with_max_in_flight(2).with_max_attempts(3),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(2), || broker.log().finished.len() == 2).await);
    assert_eq!(*handler.handled.borrow(), vec!["fine".to_string()]);
    assert_eq!(handler.gave_up.get(), 1);
    assert!(broker.log().requeued.is_empty());
    assert_eq!(reader.stats().backoff_level, 0);

    reader.close().await.unwrap();
}

#[compio::test]
async fn test_giving_up_during_backoff_keeps_consuming() {
    let broker = FakeBroker::start(Script::default()).await;
    broker.push(0, "flaky");
    broker.push(5, "poison");
    broker.push(0, "good");

    let handler = Recorder {
        fail_body: Some("flaky"),
        ..Recorder::default()
    };
    let backoff = BackoffPolicy::default()
        .with_base_delay(Duration::from_millis(20))
        .with_max_delay(Duration::from_millis(80));
    let reader = Reader::start(
        [broker.address.clone()],
        "events",
        "archive",
        handler.clone(),
        fast_config()
            .with_max_in_flight(1)
            .with_max_attempts(3)
            .with_backoff(backoff),
    )
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || handler.handled.borrow().len() == 2).await,
        "stalled after giving up: {:?}",
        handler.handled.borrow()
    );
    assert_eq!(*handler.handled.borrow(), ["flaky", "good"]);
    assert_eq!(handler.gave_up.get(), 1);
    assert!(wait_until(Duration::from_secs(2), || reader.stats().backoff_level == 0).await);
    {
        let log = broker.log();
        assert_eq!(log.requeued.len(), 1);
        assert_eq!(log.finished.len(), 2);
        assert!(log.peak_in_flight <= 1);
    }

    reader.close().await.unwrap();
}

#[compio::test]
async fn test_discovery_adds_drains_and_survives_failed_lookups() {
    let first = FakeBroker::start(Script::default()).await;
    let second = FakeBroker::start(Script::default()).await;
    first.push(0, "held");

    let discovery = Scripted::default();
    *discovery.answer.borrow_mut() = Some(vec![first.address.clone()]);

    let (gate_tx, gate) = flume::unbounded();
    let seen = Rc::new(Cell::new(0));
    let mut config = fast_config()
        .with_max_in_flight(1)
        .with_lookup_interval(Duration::from_millis(100));
    config.lookup_jitter = 0.0;
    let reader = Reader::start_with_discovery(
        discovery.clone(),
        Vec::new(),
        "events",
        "archive",
        Gated {
            gate,
            seen: seen.clone(),
        },
        config,
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(3), || seen.get() == 1).await);
    assert_eq!(first.log().connections, 1);

    // A failing lookup keeps the brokers already found.
    *discovery.answer.borrow_mut() = None;
    let before = discovery.lookups.get();
    assert!(wait_until(Duration::from_secs(2), || discovery.lookups.get() >= before + 2).await);
    assert_eq!(reader.stats().connections, 1);
    assert_eq!(first.log().count("CLS"), 0);

    // The first broker leaves: credit is withdrawn but the connection stays
    // open until its message is answered.
    *discovery.answer.borrow_mut() = Some(vec![second.address.clone()]);
    assert!(wait_until(Duration::from_secs(2), || second.log().count("SUB") == 1).await);
    assert!(wait_until(Duration::from_secs(2), || first.log().rdy.last() == Some(&0)).await);
    compio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(first.log().count("CLS"), 0, "drained connection closed with a message in flight");
    assert!(
        second.log().rdy.iter().all(|&n| n == 0),
        "credit granted while the drained message is held: {:?}",
        second.log().rdy
    );

    gate_tx.send(()).unwrap();
    assert!(wait_until(Duration::from_secs(2), || first.log().count("CLS") == 1).await);
    assert_eq!(first.log().finished.len(), 1);
    assert_eq!(first.log().connections, 1, "a drained broker is not reconnected");
    assert!(wait_until(Duration::from_secs(2), || second.log().rdy.last() == Some(&1)).await);
    assert_eq!(reader.stats().connections, 1);

    reader.close().await.unwrap();
}

#[compio::test]
async fn test_reader_over_deflate_with_auth() {
    let broker = FakeBroker::start(Script {
        deflate: true,
        auth_secret: Some("s3cret"),
        ..Script::default()
    })
    .await;
    for body in ["x", "y"] {
        broker.push(0, body);
    }

    let connection = ConnectionConfig::default()
        .with_identify(IdentifyOptions::default().with_deflate(1))
        .with_auth_secret("s3cret");
    let handler = Recorder::default();
    let reader = Reader::start(
        [broker.address.clone()],
        "events",
        "archive",
        handler.clone(),
        fast_config().with_max_in_flight(2).with_connection(connection),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(2), || broker.log().finished.len() == 2).await);
    assert_eq!(broker.log().count("AUTH"), 1);
    assert!(handler.failures.borrow().is_empty());

    reader.close().await.unwrap();
    assert_eq!(broker.log().count("CLS"), 1);
}

#[compio::test]
async fn test_close_waits_for_in_flight() {
    let broker = FakeBroker::start(Script::default()).await;
    broker.push(0, "slow");

    let (gate_tx, gate) = flume::unbounded();
    let seen = Rc::new(Cell::new(0));
    let reader = Reader::start(
        [broker.address.clone()],
        "events",
        "archive",
        Gated {
            gate,
            seen: seen.clone(),
        },
        fast_config(),
    )
    .unwrap();
    assert!(wait_until(Duration::from_secs(2), || seen.get() == 1).await);

    let release = async {
        compio::time::sleep(Duration::from_millis(200)).await;
        assert!(broker.log().finished.is_empty());
        assert_eq!(broker.log().count("CLS"), 0, "CLS sent while a message is in flight");
        gate_tx.send(()).unwrap();
    };
    let (closed, ()) = futures::join!(reader.close(), release);
    closed.unwrap();

    let log = broker.log();
    assert_eq!(log.finished.len(), 1);
    assert_eq!(log.count("CLS"), 1);
    assert!(log.rdy.ends_with(&[0]), "credit withdrawn on close: {:?}", log.rdy);
}

#[cfg(unix)]
#[compio::test]
async fn test_reader_over_unix_socket() {
    let path = std::env::temp_dir().join(format!("quay-reader-{}.sock", std::process::id()));
    let broker = FakeBroker::start_unix(&path, Script::default()).await;
    for body in ["a", "b", "c"] {
        broker.push(0, body);
    }

    let handler = Recorder::default();
    let reader = Reader::start(
        [broker.address.clone()],
        "events",
        "archive",
        handler.clone(),
        fast_config().with_max_in_flight(3),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(2), || broker.log().finished.len() == 3).await);
    let mut handled = handler.handled.borrow().clone();
    handled.sort();
    assert_eq!(handled, ["a", "b", "c"]);

    reader.close().await.unwrap();
    let _ = std::fs::remove_file(&path);
}
