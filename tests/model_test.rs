//! End-to-end model scenarios: poll, publish, resync and the set path,
//! against a real commander talking to a scripted transport.

mod common;

use common::{FakeTransport, Peer, RecordingObserver};
use instrument_bridge::clock::{Clock, SystemClock};
use instrument_bridge::commander::default_commander_factory;
use instrument_bridge::config::DriverConfig;
use instrument_bridge::model::Model;
use instrument_bridge::observer::Observer;
use instrument_bridge::protocol::ProtocolRegistry;
use instrument_bridge::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SAMPLE_CONFIG: &str = r#"
ports:
- name: sample
  title: Sample Dev
  port: someport
  protocol: scpi
  idsubstring: some_dev_id
  parameters:
  - scpiname: MEAS:VOLT
    control:
      name: voltage
      title: Measured voltage
      units: V
      type: voltage
  - scpiname: CURR
    control:
      name: current
      title: Current
      units: A
      type: current
      writable: true
  - scpiname: MODE
    control:
      name: mode
      title: Mode
      type: text
      enum:
        0: Foo
        1: Bar
        2: Baz
  - scpiname: DOIT
    control:
      name: doit
      title: Do it
      type: pushbutton
"#;

struct ModelTester {
    model: Arc<Model>,
    observer: Arc<RecordingObserver>,
    transport: Arc<FakeTransport>,
    peers: mpsc::UnboundedReceiver<Peer>,
    trigger: mpsc::Sender<()>,
}

async fn start_model(config_text: &str) -> ModelTester {
    let registry = ProtocolRegistry::with_builtin();
    let config = DriverConfig::parse(config_text, &registry).expect("config should parse");
    let (transport, peers) = FakeTransport::new("someport");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let factory =
        default_commander_factory(transport.clone() as Arc<dyn Transport>, clock.clone());
    let observer = RecordingObserver::new();
    let observer_dyn: Arc<dyn Observer> = observer.clone();
    let model = Arc::new(Model::new(factory, registry, config, observer_dyn, clock));
    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    model.set_poll_trigger(trigger_rx);
    model.start().await.expect("model should start");
    ModelTester {
        model,
        observer,
        transport,
        peers,
        trigger: trigger_tx,
    }
}

impl ModelTester {
    async fn next_peer(&mut self) -> Peer {
        self.peers.recv().await.expect("transport dropped")
    }

    async fn trigger_poll(&self) {
        self.trigger.send(()).await.expect("poll loop stopped");
    }

    /// Flushes dirty controls until `expected` events have accumulated.
    async fn flush_until(&self, expected: usize) {
        for _ in 0..100 {
            self.model.poll().await;
            if self.observer.len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} events, got {}: {:?}",
            expected,
            self.observer.len(),
            self.observer.take()
        );
    }

    /// Lets the in-flight poll cycle finish, then flushes.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.model.poll().await;
    }

    async fn first_poll(&mut self, peer: &mut Peer) {
        self.trigger_poll().await;
        peer.expect_command("*IDN?").await;
        peer.write_response("some_dev_id").await;
        peer.expect_command("MEAS:VOLT?").await;
        peer.write_response("12.0").await;
        peer.expect_command("CURR?").await;
        peer.write_response("3.5").await;
        peer.expect_command("MODE?").await;
        peer.write_response("1").await;

        self.flush_until(5).await;
        assert_eq!(
            self.observer.take(),
            vec![
                "meta sample/id type=\"text\" title=\"\" units=\"\" value=\"some_dev_id\" writable=false",
                "meta sample/voltage type=\"voltage\" title=\"Measured voltage\" units=\"V\" value=\"12.0\" writable=false",
                "meta sample/current type=\"current\" title=\"Current\" units=\"A\" value=\"3.5\" writable=true",
                "meta sample/mode type=\"text\" title=\"Mode\" units=\"\" value=\"Bar\" writable=false",
                "meta sample/doit type=\"pushbutton\" title=\"Do it\" units=\"\" value=\"\" writable=true",
            ]
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_poll_publishes_metadata_once_then_changed_values() {
    let mut t = start_model(SAMPLE_CONFIG).await;
    assert_eq!(t.observer.take(), vec!["device sample: Sample Dev"]);
    let mut peer = t.next_peer().await;
    t.model.wait_ready().await;

    t.first_poll(&mut peer).await;

    // the second poll skips the id, and only the changed mode value is
    // republished
    t.trigger_poll().await;
    peer.expect_command("MEAS:VOLT?").await;
    peer.write_response("12.0").await;
    peer.expect_command("CURR?").await;
    peer.write_response("3.5").await;
    peer.expect_command("MODE?").await;
    peer.write_response("0").await;
    t.flush_until(1).await;
    assert_eq!(t.observer.take(), vec!["value sample/mode=\"Foo\""]);

    // a poll with identical values publishes nothing
    t.trigger_poll().await;
    peer.expect_command("MEAS:VOLT?").await;
    peer.write_response("12.0").await;
    peer.expect_command("CURR?").await;
    peer.write_response("3.5").await;
    peer.expect_command("MODE?").await;
    peer.write_response("0").await;
    t.settle().await;
    assert_eq!(t.observer.take(), Vec::<String>::new());

    t.model.stop().await;
    assert!(peer.is_closed(), "stop must close the port connection");
    t.model.stop().await; // idempotent
}

#[tokio::test(start_paused = true)]
async fn test_resync_reidentifies_every_poll() {
    let config = SAMPLE_CONFIG.replace("protocol: scpi", "protocol: scpi\n  resync: true");
    let mut t = start_model(&config).await;
    t.observer.take();
    let mut peer = t.next_peer().await;
    t.model.wait_ready().await;

    t.first_poll(&mut peer).await;

    t.trigger_poll().await;
    peer.expect_command("*IDN?").await;
    peer.write_response("some_dev_id").await;
    peer.expect_command("MEAS:VOLT?").await;
    peer.write_response("12.0").await;
    peer.expect_command("CURR?").await;
    peer.write_response("3.5").await;
    peer.expect_command("MODE?").await;
    peer.write_response("0").await;
    t.flush_until(1).await;
    // the unchanged id is not republished even though it was re-read
    assert_eq!(t.observer.take(), vec!["value sample/mode=\"Foo\""]);

    t.model.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_set_path() {
    let mut t = start_model(SAMPLE_CONFIG).await;
    t.observer.take();
    let mut peer = t.next_peer().await;
    t.model.wait_ready().await;
    t.first_poll(&mut peer).await;

    // writable control
    let model = t.model.clone();
    let set = tokio::spawn(async move { model.accept_set("sample", "current", "3.6").await });
    peer.expect_command("CURR 3.6; *OPC?").await;
    peer.write_response("1").await;
    assert!(set.await.unwrap());

    // pushbutton
    let model = t.model.clone();
    let set = tokio::spawn(async move { model.accept_set("sample", "doit", "1").await });
    peer.expect_command("DOIT; *OPC?").await;
    peer.write_response("1").await;
    assert!(set.await.unwrap());

    // a poll echoing the written value back publishes nothing new, and a
    // poll observing a corrected value publishes the correction
    t.trigger_poll().await;
    peer.expect_command("MEAS:VOLT?").await;
    peer.write_response("12.0").await;
    peer.expect_command("CURR?").await;
    peer.write_response("3.6").await;
    peer.expect_command("MODE?").await;
    peer.write_response("1").await;
    t.settle().await;
    assert_eq!(t.observer.take(), Vec::<String>::new());

    t.trigger_poll().await;
    peer.expect_command("MEAS:VOLT?").await;
    peer.write_response("12.0").await;
    peer.expect_command("CURR?").await;
    peer.write_response("3.7").await;
    peer.expect_command("MODE?").await;
    peer.write_response("1").await;
    t.flush_until(1).await;
    assert_eq!(t.observer.take(), vec!["value sample/current=\"3.7\""]);

    t.model.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_set_rejections() {
    let mut t = start_model(SAMPLE_CONFIG).await;
    t.observer.take();
    let mut peer = t.next_peer().await;
    t.model.wait_ready().await;
    t.first_poll(&mut peer).await;

    assert!(!t.model.accept_set("sample", "nonesuch", "1").await);
    assert!(!t.model.accept_set("sample", "voltage", "13.0").await);
    assert!(!t.model.accept_set("nodev", "current", "1").await);
    assert_eq!(t.transport.connect_count(), 1);

    t.model.stop().await;
}
