//! Bridge tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::mock::{
    call_log, calls, count, Attempt, Call, CallLog, MockRadio, ScriptedSession, Step,
};
use crate::supervisor::LinkState;

const DEST: NodeId = 1;

fn settings(attempts: u32) -> BridgeSettings {
    let radio = RadioConfig {
        destination: DEST,
        inter_frame_delay_ms: 0,
        ..RadioConfig::default()
    };
    BridgeSettings {
        subscription: Subscription {
            filter: "/controlling-drone".to_string(),
            qos: QoS::AtLeastOnce,
        },
        retry: RetryPolicy {
            attempts,
            interval: Duration::from_secs(1),
        },
        radio,
    }
}

fn transmitted(log: &CallLog) -> Vec<Bytes> {
    calls(log)
        .into_iter()
        .filter_map(|call| match call {
            Call::Transmit(_, payload) => Some(payload),
            _ => None,
        })
        .collect()
}

fn is_transmit(call: &Call) -> bool {
    matches!(call, Call::Transmit(..))
}

fn is_reconnect(call: &Call) -> bool {
    matches!(call, Call::Reconnect)
}

async fn started(
    session: ScriptedSession,
    radio: MockRadio,
    attempts: u32,
) -> MessageBridge<ScriptedSession, MockRadio> {
    let mut bridge = MessageBridge::new(session, radio, settings(attempts));
    bridge.start().await.unwrap();
    bridge
}

#[tokio::test]
async fn test_messages_transmitted_in_order() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone()).messages(["a", "bb", "ccc"]);
    let mut bridge = started(session, MockRadio::new(log.clone(), 255), 30).await;

    let exit = bridge.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(exit, BridgeExit::BrokerClosed);
    assert_eq!(
        transmitted(&log),
        vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"bb"),
            Bytes::from_static(b"ccc")
        ]
    );
    assert_eq!(bridge.stats().transmitted, 3);
    assert_eq!(bridge.supervisor().state(), LinkState::Disconnected);
}

#[tokio::test]
async fn test_each_transmit_completes_before_next_fetch() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone()).messages(["x", "y"]);
    let mut bridge = started(session, MockRadio::new(log.clone(), 255), 30).await;

    bridge.run(&CancellationToken::new()).await.unwrap();

    let sent = |b: &'static [u8]| Call::Transmit(DEST, Bytes::from_static(b));
    assert_eq!(
        calls(&log),
        vec![
            Call::Initialize,
            Call::Connect,
            Call::Subscribe("/controlling-drone".to_string(), QoS::AtLeastOnce),
            Call::NextMessage,
            sent(b"x"),
            Call::AwaitComplete,
            Call::NextMessage,
            sent(b"y"),
            Call::AwaitComplete,
            Call::NextMessage,
        ]
    );
}

#[tokio::test]
async fn test_end_of_stream_while_connected_stops() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone())
        .messages(["a"])
        .step(Step::End)
        .messages(["b"]);
    let mut bridge = started(session, MockRadio::new(log.clone(), 255), 30).await;

    let exit = bridge.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(exit, BridgeExit::BrokerClosed);
    assert_eq!(transmitted(&log), vec![Bytes::from_static(b"a")]);
    assert_eq!(count(&log, is_reconnect), 0);
}

#[tokio::test]
async fn test_oversized_dropped_next_sent() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone())
        .messages([vec![0xAB; 300]])
        .messages(["ok"]);
    let mut bridge = started(session, MockRadio::new(log.clone(), 255), 30).await;

    bridge.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(transmitted(&log), vec![Bytes::from_static(b"ok")]);
    let stats = bridge.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.dropped_oversized, 1);
    assert_eq!(stats.transmitted, 1);
}

#[tokio::test]
async fn test_payload_at_limit_is_sent() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone()).messages([vec![7u8; 251]]);
    let mut bridge = started(session, MockRadio::new(log.clone(), 251), 30).await;

    bridge.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(count(&log, is_transmit), 1);
}

#[tokio::test]
async fn test_empty_payload_is_sent() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone()).messages([Bytes::new()]);
    let mut bridge = started(session, MockRadio::new(log.clone(), 255), 30).await;

    bridge.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(transmitted(&log), vec![Bytes::new()]);
}

#[tokio::test]
async fn test_transmit_failure_continues() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone()).messages(["one", "two", "three"]);
    let radio = MockRadio::new(log.clone(), 255).fail_transmit(1);
    let mut bridge = started(session, radio, 30).await;

    bridge.run(&CancellationToken::new()).await.unwrap();

    // Attempted once each, never retried
    assert_eq!(count(&log, is_transmit), 3);
    let stats = bridge.stats();
    assert_eq!(stats.transmitted, 2);
    assert_eq!(stats.transmit_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_before_next_pull() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone())
        .messages(["before"])
        .step(Step::Drop)
        .messages(["after"])
        .reconnect(Attempt::Err)
        .reconnect(Attempt::Ok);
    let mut bridge = started(session, MockRadio::new(log.clone(), 255), 30).await;

    let exit = bridge.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(exit, BridgeExit::BrokerClosed);

    let log = calls(&log);
    let reconnected = log
        .iter()
        .rposition(|c| matches!(c, Call::Reconnect))
        .unwrap();
    assert_eq!(
        log[reconnected + 1],
        Call::Subscribe("/controlling-drone".to_string(), QoS::AtLeastOnce)
    );
    assert_eq!(log[reconnected + 2], Call::NextMessage);
    assert_eq!(
        log[reconnected + 3],
        Call::Transmit(DEST, Bytes::from_static(b"after"))
    );
    assert_eq!(bridge.stats().reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_budget() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone())
        .step(Step::Drop)
        .reconnect_always(Attempt::Err);
    let mut bridge = started(session, MockRadio::new(log.clone(), 255), 30).await;

    let result = bridge.run(&CancellationToken::new()).await;

    assert!(matches!(result, Err(BridgeError::BrokerUnrecoverable)));
    assert_eq!(count(&log, is_reconnect), 30);
    assert_eq!(bridge.supervisor().state(), LinkState::Failed);

    bridge.shutdown().await;
    let log = calls(&log);
    assert_eq!(log[log.len() - 2..].to_vec(), vec![Call::Disconnect, Call::Shutdown]);
}

#[tokio::test]
async fn test_cancel_before_next_message() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone()).messages(["never"]);
    let mut bridge = started(session, MockRadio::new(log.clone(), 255), 30).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let exit = bridge.run(&cancel).await.unwrap();

    assert_eq!(exit, BridgeExit::Cancelled);
    assert_eq!(count(&log, is_transmit), 0);
}

#[tokio::test]
async fn test_cancel_while_transmitting_finishes_frame() {
    let log = call_log();
    let cancel = CancellationToken::new();
    let session = ScriptedSession::new(log.clone()).messages(["a", "b"]);
    let radio = MockRadio::new(log.clone(), 255).cancel_on_transmit(cancel.clone());
    let mut bridge = started(session, radio, 30).await;

    let exit = bridge.run(&cancel).await.unwrap();
    assert_eq!(exit, BridgeExit::Cancelled);

    let log = calls(&log);
    assert_eq!(
        log[log.len() - 3..].to_vec(),
        vec![
            Call::NextMessage,
            Call::Transmit(DEST, Bytes::from_static(b"a")),
            Call::AwaitComplete,
        ]
    );
    assert_eq!(bridge.stats().transmitted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_broker_unresponsive_at_startup() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone()).hang_connect();
    let mut bridge = MessageBridge::new(session, MockRadio::new(log.clone(), 255), settings(30));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        stopper.cancel();
    });

    let exit = bridge.serve(&cancel).await.unwrap();
    assert_eq!(exit, BridgeExit::Cancelled);
    assert_eq!(calls(&log), vec![Call::Initialize, Call::Connect]);

    bridge.shutdown().await;
    assert_eq!(count(&log, |c| matches!(c, Call::Shutdown)), 1);
}

#[tokio::test]
async fn test_serve_starts_then_forwards() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone()).messages(["a"]);
    let mut bridge = MessageBridge::new(session, MockRadio::new(log.clone(), 255), settings(30));

    let exit = bridge.serve(&CancellationToken::new()).await.unwrap();
    assert_eq!(exit, BridgeExit::BrokerClosed);
    assert_eq!(transmitted(&log), vec![Bytes::from_static(b"a")]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_reconnect_backoff() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone())
        .step(Step::Drop)
        .reconnect_always(Attempt::Err);
    let mut bridge = started(session, MockRadio::new(log.clone(), 255), 30).await;

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        stopper.cancel();
    });

    let exit = bridge.run(&cancel).await.unwrap();
    assert_eq!(exit, BridgeExit::Cancelled);
    assert_eq!(count(&log, is_reconnect), 2);
}

#[tokio::test]
async fn test_start_fails_when_radio_fails() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone());
    let radio = MockRadio::new(log.clone(), 255).fail_init();
    let mut bridge = MessageBridge::new(session, radio, settings(30));

    let result = bridge.start().await;
    assert!(matches!(result, Err(BridgeError::Radio(_))));
    // Broker is never contacted without a working radio
    assert_eq!(calls(&log), vec![Call::Initialize]);
}

#[tokio::test]
async fn test_start_fails_when_broker_refuses() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone()).refuse_connect();
    let radio = MockRadio::new(log.clone(), 255);
    let mut bridge = MessageBridge::new(session, radio, settings(30));

    let result = bridge.start().await;
    assert!(matches!(
        result,
        Err(BridgeError::Connect(SessionError::Refused(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_inter_frame_delay() {
    let log = call_log();
    let session = ScriptedSession::new(log.clone()).messages(["a", "b", "c"]);
    let mut config = settings(30);
    config.radio.inter_frame_delay_ms = 100;
    let mut bridge = MessageBridge::new(session, MockRadio::new(log.clone(), 255), config);
    bridge.start().await.unwrap();

    let start = tokio::time::Instant::now();
    bridge.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_millis(300));
}

#[tokio::test]
async fn test_status_callback_sequence() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let log = call_log();
    let session = ScriptedSession::new(log.clone()).messages(["a"]);
    let radio = MockRadio::new(log.clone(), 255);
    let mut bridge = MessageBridge::new(session, radio, settings(30));
    bridge.set_status_callback(Arc::new(move |s| sink.lock().unwrap().push(s)));

    bridge.start().await.unwrap();
    bridge.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            LinkStatus::Connected,
            LinkStatus::Transmitting,
            LinkStatus::Idle,
            LinkStatus::Disconnected,
        ]
    );
}

#[test]
fn test_settings_from_config() {
    let config = Config::parse(
        "[bridge]\ntopic = \"/t\"\nqos = 2\n[reconnect]\nattempts = 4\n[radio]\ndestination = 9\n",
    )
    .unwrap();
    let settings = BridgeSettings::from_config(&config);
    assert_eq!(settings.subscription.filter, "/t");
    assert_eq!(settings.subscription.qos, QoS::ExactlyOnce);
    assert_eq!(settings.retry.attempts, 4);
    assert_eq!(settings.radio.destination, 9);

    let bridge = MessageBridge::new(
        ScriptedSession::new(call_log()),
        MockRadio::new(call_log(), 255),
        settings,
    );
    assert_eq!(bridge.supervisor().policy().attempts, 4);
}

#[tokio::test]
async fn test_handle_message_reports_delivery() {
    let log = call_log();
    let radio = MockRadio::new(log.clone(), 4).fail_transmit(1);
    let mut bridge = started(ScriptedSession::new(log.clone()), radio, 30).await;

    let ok = InboundMessage::new("/t", "abcd");
    let big = InboundMessage::new("/t", "abcde");
    assert_eq!(bridge.handle_message(&ok).await, Delivery::Transmitted);
    assert_eq!(bridge.handle_message(&big).await, Delivery::DroppedOversized);
    assert_eq!(bridge.handle_message(&ok).await, Delivery::TransmitFailed);

    let stats = bridge.stats();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.transmitted, 1);
    assert_eq!(stats.dropped_oversized, 1);
    assert_eq!(stats.transmit_failed, 1);
}

fn run_bridge(payloads: Vec<Vec<u8>>, max: usize) -> Vec<Bytes> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let log = call_log();
        let session = ScriptedSession::new(log.clone()).messages(payloads);
        let mut bridge = started(session, MockRadio::new(log.clone(), max), 30).await;
        bridge.run(&CancellationToken::new()).await.unwrap();
        transmitted(&log)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_valid_messages_sent_once_in_order(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..=64), 0..20)
    ) {
        let sent = run_bridge(payloads.clone(), 255);
        let expected: Vec<Bytes> = payloads.into_iter().map(Bytes::from).collect();
        prop_assert_eq!(sent, expected);
    }

    #[test]
    fn prop_only_fitting_payloads_sent(
        lens in prop::collection::vec(0usize..400, 0..20)
    ) {
        let payloads: Vec<Vec<u8>> = lens.iter().map(|&n| vec![0x55; n]).collect();
        let sent = run_bridge(payloads.clone(), 255);
        let expected: Vec<Bytes> = payloads
            .into_iter()
            .filter(|p| p.len() <= 255)
            .map(Bytes::from)
            .collect();
        prop_assert_eq!(sent, expected);
    }

    #[test]
    fn prop_frame_construction_is_pure(
        payload in prop::collection::vec(any::<u8>(), 0..300),
        dest in any::<u8>(),
    ) {
        let bytes = Bytes::from(payload);
        let a = RadioFrame::from_payload(dest, bytes.clone(), 255);
        let b = RadioFrame::from_payload(dest, bytes.clone(), 255);
        prop_assert_eq!(&a, &b);
        match a {
            Ok(frame) => {
                prop_assert!(bytes.len() <= 255);
                prop_assert_eq!(frame.payload(), &bytes);
                prop_assert_eq!(frame.destination(), dest);
            }
            Err(e) => {
                prop_assert_eq!(e, FrameError::Oversized { len: bytes.len(), max: 255 });
            }
        }
    }
}
