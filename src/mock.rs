//! Scripted collaborators for unit tests
//!
//! Both mocks append to one shared [`CallLog`] so tests can assert on the
//! interleaving of broker and radio calls.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::config::RadioConfig;
use crate::protocol::{ConnectReturnCode, QoS};
use crate::radio::{NodeId, RadioError, RadioFrame, RadioTransport};
use crate::session::{BrokerSession, InboundMessage, SessionError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    Subscribe(String, QoS),
    NextMessage,
    Reconnect,
    Disconnect,
    Initialize,
    Transmit(NodeId, Bytes),
    AwaitComplete,
    Shutdown,
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(log: &CallLog) -> Vec<Call> {
    log.lock().unwrap().clone()
}

pub fn count(log: &CallLog, pred: impl Fn(&Call) -> bool) -> usize {
    log.lock().unwrap().iter().filter(|c| pred(c)).count()
}

/// What the next `next_message` call yields
#[derive(Debug, Clone)]
pub enum Step {
    Message(InboundMessage),
    /// Connection drops; `None` with `is_connected() == false`
    Drop,
    /// `None` while still connected
    End,
}

/// Outcome of one `reconnect` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Ok,
    Err,
    /// Reports success but the session stays disconnected
    OkButDisconnected,
    /// Broker never answers
    Hang,
}

pub struct ScriptedSession {
    log: CallLog,
    steps: VecDeque<Step>,
    reconnects: VecDeque<Attempt>,
    /// Reconnect outcome once the script runs out
    default_attempt: Attempt,
    subscribe_failures: VecDeque<bool>,
    refuse_connect: bool,
    hang_connect: bool,
    connected: bool,
}

impl ScriptedSession {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            steps: VecDeque::new(),
            reconnects: VecDeque::new(),
            default_attempt: Attempt::Ok,
            subscribe_failures: VecDeque::new(),
            refuse_connect: false,
            hang_connect: false,
            connected: false,
        }
    }

    pub fn messages<I, P>(mut self, payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        for payload in payloads {
            self.steps
                .push_back(Step::Message(InboundMessage::new("/test", payload)));
        }
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push_back(step);
        self
    }

    pub fn reconnect(mut self, attempt: Attempt) -> Self {
        self.reconnects.push_back(attempt);
        self
    }

    pub fn reconnect_always(mut self, attempt: Attempt) -> Self {
        self.default_attempt = attempt;
        self
    }

    /// Queue subscribe results; `true` means the broker rejects it
    pub fn subscribe_fails(mut self, fail: bool) -> Self {
        self.subscribe_failures.push_back(fail);
        self
    }

    pub fn refuse_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    pub fn hang_connect(mut self) -> Self {
        self.hang_connect = true;
        self
    }

    fn record(&self, call: Call) {
        self.log.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BrokerSession for ScriptedSession {
    async fn connect(&mut self) -> Result<(), SessionError> {
        self.record(Call::Connect);
        if self.hang_connect {
            std::future::pending::<()>().await;
        }
        if self.refuse_connect {
            return Err(SessionError::Refused(ConnectReturnCode::NotAuthorized));
        }
        self.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        assert!(self.connected, "subscribe called while disconnected");
        self.record(Call::Subscribe(topic.to_string(), qos));
        if self.subscribe_failures.pop_front().unwrap_or(false) {
            return Err(SessionError::SubscriptionRejected(topic.to_string()));
        }
        Ok(())
    }

    async fn next_message(&mut self) -> Option<InboundMessage> {
        self.record(Call::NextMessage);
        if !self.connected {
            return None;
        }
        match self.steps.pop_front() {
            Some(Step::Message(msg)) => Some(msg),
            Some(Step::Drop) => {
                self.connected = false;
                None
            }
            Some(Step::End) | None => None,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn reconnect(&mut self) -> Result<(), SessionError> {
        self.record(Call::Reconnect);
        let attempt = self.reconnects.pop_front().unwrap_or(self.default_attempt);
        match attempt {
            Attempt::Ok => {
                self.connected = true;
                Ok(())
            }
            Attempt::Err => {
                self.connected = false;
                Err(SessionError::ConnectionLost("connection refused".into()))
            }
            Attempt::OkButDisconnected => {
                self.connected = false;
                Ok(())
            }
            Attempt::Hang => {
                self.connected = false;
                std::future::pending().await
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        self.record(Call::Disconnect);
        self.connected = false;
        Ok(())
    }
}

pub struct MockRadio {
    log: CallLog,
    max_frame_size: usize,
    failing: HashSet<usize>,
    fail_init: bool,
    /// Cancelled from inside `transmit`, while the frame is in flight
    cancel_on_transmit: Option<CancellationToken>,
    transmits: usize,
    initialized: bool,
    in_flight: bool,
}

impl MockRadio {
    pub fn new(log: CallLog, max_frame_size: usize) -> Self {
        Self {
            log,
            max_frame_size,
            failing: HashSet::new(),
            fail_init: false,
            cancel_on_transmit: None,
            transmits: 0,
            initialized: false,
            in_flight: false,
        }
    }

    /// Make the n-th (0-based) transmit call fail
    pub fn fail_transmit(mut self, index: usize) -> Self {
        self.failing.insert(index);
        self
    }

    pub fn fail_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn cancel_on_transmit(mut self, token: CancellationToken) -> Self {
        self.cancel_on_transmit = Some(token);
        self
    }

    fn record(&self, call: Call) {
        self.log.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RadioTransport for MockRadio {
    async fn initialize(&mut self, _config: &RadioConfig) -> Result<(), RadioError> {
        self.record(Call::Initialize);
        if self.fail_init {
            return Err(RadioError::InvalidConfig("no radio attached".into()));
        }
        self.initialized = true;
        Ok(())
    }

    async fn transmit(&mut self, frame: &RadioFrame) -> Result<(), RadioError> {
        assert!(self.initialized, "transmit before initialize");
        assert!(!self.in_flight, "transmit while a frame is in flight");
        assert!(frame.len() <= self.max_frame_size, "oversized frame reached radio");
        self.record(Call::Transmit(frame.destination(), frame.payload().clone()));
        if let Some(token) = &self.cancel_on_transmit {
            token.cancel();
        }

        let index = self.transmits;
        self.transmits += 1;
        if self.failing.contains(&index) {
            return Err(RadioError::Io(std::io::Error::other("spi write failed")));
        }
        self.in_flight = true;
        Ok(())
    }

    async fn await_transmit_complete(&mut self) -> Result<(), RadioError> {
        self.record(Call::AwaitComplete);
        self.in_flight = false;
        Ok(())
    }

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    async fn shutdown(&mut self) -> Result<(), RadioError> {
        self.record(Call::Shutdown);
        self.initialized = false;
        Ok(())
    }
}
