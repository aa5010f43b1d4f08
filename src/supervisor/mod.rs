//! Connection Supervisor
//!
//! Keeps the broker session usable or declares it unrecoverable. When the
//! bridge sees the connection drop it hands the session to
//! [`ConnectionSupervisor::supervise`], which reconnects with a bounded
//! [`RetryBudget`] and a fixed pause between attempts, then restores the
//! subscription before any further message is consumed.
//!
//! ```text
//! Connected -> Disconnected -> Reconnecting -> Resubscribing -> Connected
//!                                  ^   |              |
//!                                  +---+--------------+  (attempt failed)
//!                                      |
//!                                      +-> Failed        (budget exhausted)
//! ```


use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReconnectConfig;
use crate::protocol::Subscription;
use crate::session::{BrokerSession, SessionError};
use crate::status::{notify, LinkStatus, StatusCallback};

/// Connection state tracked by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Connected and subscribed
    Connected,
    /// Connection lost, budget allocated
    Disconnected,
    /// Calling `reconnect` on the session
    Reconnecting,
    /// Reconnected, restoring the subscription
    Resubscribing,
    /// Budget exhausted; the bridge must stop
    Failed,
}

/// Result of a supervision run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// Session reconnected and resubscribed
    Recovered,
    /// Every attempt in the budget failed
    GiveUp,
    /// Stop requested while backing off between attempts
    Cancelled,
}

/// Reconnection attempts left after a connection loss
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    attempts_remaining: u32,
    interval: Duration,
}

impl RetryBudget {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts_remaining: attempts,
            interval,
        }
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts_remaining == 0
    }

    /// Record one failed attempt
    pub fn consume(&mut self) {
        self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
    }
}

/// Fixed-interval, bounded reconnection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    /// Fresh budget for one disconnection
    pub fn budget(&self) -> RetryBudget {
        RetryBudget::new(self.attempts, self.interval)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(1),
        }
    }
}

impl From<&ReconnectConfig> for RetryPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            attempts: config.attempts,
            interval: config.interval_duration(),
        }
    }
}

/// Owns the subscription and the broker connection state machine
pub struct ConnectionSupervisor {
    policy: RetryPolicy,
    subscription: Subscription,
    state: LinkState,
    recoveries: u64,
    status_callback: Option<StatusCallback>,
}

impl ConnectionSupervisor {
    pub fn new(policy: RetryPolicy, subscription: Subscription) -> Self {
        Self {
            policy,
            subscription,
            state: LinkState::Disconnected,
            recoveries: 0,
            status_callback: None,
        }
    }

    /// Set the callback notified on connect/disconnect transitions
    pub fn set_status_callback(&mut self, callback: StatusCallback) {
        self.status_callback = Some(callback);
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Successful recoveries so far
    pub fn recoveries(&self) -> u64 {
        self.recoveries
    }

    fn transition(&mut self, next: LinkState) {
        if self.state == next {
            return;
        }
        debug!("Link state {:?} -> {:?}", self.state, next);
        let was_connected = self.state == LinkState::Connected;
        self.state = next;

        match next {
            LinkState::Connected => notify(&self.status_callback, LinkStatus::Connected),
            LinkState::Disconnected if was_connected => {
                notify(&self.status_callback, LinkStatus::Disconnected)
            }
            _ => {}
        }
    }

    /// Initial connect and subscribe. Failures here are not retried.
    pub async fn establish<S>(&mut self, session: &mut S) -> Result<(), SessionError>
    where
        S: BrokerSession + ?Sized,
    {
        session.connect().await?;
        session
            .subscribe(&self.subscription.filter, self.subscription.qos)
            .await?;
        self.transition(LinkState::Connected);
        Ok(())
    }

    /// Record that the broker went away cleanly (no recovery attempted)
    pub fn mark_disconnected(&mut self) {
        self.transition(LinkState::Disconnected);
    }

    /// Reconnect and resubscribe within one retry budget.
    ///
    /// Calls `reconnect` at most `policy.attempts` times and never subscribes
    /// while the session reports itself disconnected. Between failed attempts
    /// it sleeps one interval. The stop token cuts short both the sleep and
    /// an attempt still waiting on the broker.
    pub async fn supervise<S>(
        &mut self,
        session: &mut S,
        cancel: &CancellationToken,
    ) -> SupervisorOutcome
    where
        S: BrokerSession + ?Sized,
    {
        self.transition(LinkState::Disconnected);
        let mut budget = self.policy.budget();
        warn!(
            "Lost connection, attempting reconnect ({} attempts, {:?} apart)",
            budget.attempts_remaining(),
            budget.interval()
        );

        // A live connection is only reused on the first pass; after a failed
        // subscribe the next pass starts from a fresh connection
        let mut force_reconnect = false;

        loop {
            let attempt = self.policy.attempts - budget.attempts_remaining() + 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.abandon(),
                result = self.attempt(session, force_reconnect) => result,
            };

            let failure = match result {
                Ok(()) => {
                    self.recoveries += 1;
                    info!("Reconnected after {} attempt(s)", attempt);
                    return SupervisorOutcome::Recovered;
                }
                Err(e) => e,
            };
            force_reconnect = true;

            budget.consume();
            if budget.is_exhausted() {
                self.transition(LinkState::Failed);
                error!(
                    "Reconnect failed after {} attempts: {}",
                    self.policy.attempts, failure
                );
                return SupervisorOutcome::GiveUp;
            }

            debug!(
                "Reconnect attempt {} failed: {} ({} left)",
                attempt,
                failure,
                budget.attempts_remaining()
            );

            tokio::select! {
                _ = cancel.cancelled() => return self.abandon(),
                _ = tokio::time::sleep(budget.interval()) => {}
            }
        }
    }

    fn abandon(&mut self) -> SupervisorOutcome {
        self.transition(LinkState::Disconnected);
        info!("Reconnect abandoned: stop requested");
        SupervisorOutcome::Cancelled
    }

    /// One Reconnecting -> Resubscribing -> Connected pass
    async fn attempt<S>(
        &mut self,
        session: &mut S,
        force_reconnect: bool,
    ) -> Result<(), SessionError>
    where
        S: BrokerSession + ?Sized,
    {
        if force_reconnect || !session.is_connected() {
            self.transition(LinkState::Reconnecting);
            session.reconnect().await?;
            if !session.is_connected() {
                return Err(SessionError::NotConnected);
            }
        }

        self.transition(LinkState::Resubscribing);
        let result = session
            .subscribe(&self.subscription.filter, self.subscription.qos)
            .await;
        if result.is_ok() {
            self.transition(LinkState::Connected);
        }
        result
    }
}
