//! Transition logic for one logical client connection, free of sockets and
//! timers so every edge can be checked directly.

use std::time::Duration;
use tokio::time::Instant;

use crate::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to retry; carries the 1-based attempt number.
    Reconnecting(u32),
}

/// Exponential reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            base: config.reconnect_base_delay,
            multiplier: config.reconnect_multiplier,
            max_delay: config.reconnect_max_delay,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before reconnect `attempt` (1-based), or `None` once attempts
    /// are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = self.multiplier.saturating_pow(attempt - 1);
        Some(self.base.saturating_mul(factor).min(self.max_delay))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// What to do after the socket went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterLoss {
    Retry { attempt: u32, delay: Duration },
    GiveUp,
    /// No socket was live or pending; nothing changes.
    Ignored,
}

#[derive(Debug)]
pub struct ConnectionAttempt {
    state: ConnectionState,
    attempt_number: u32,
    backoff: Backoff,
    last_ping_sent_at: Option<Instant>,
}

impl ConnectionAttempt {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt_number: 0,
            backoff,
            last_ping_sent_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    pub fn last_ping_sent_at(&self) -> Option<Instant> {
        self.last_ping_sent_at
    }

    /// Explicit connect. Only meaningful from `Disconnected`; returns whether
    /// a new socket should be opened.
    pub fn connect_requested(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.attempt_number = 0;
        self.state = ConnectionState::Connecting;
        true
    }

    /// The server's confirmation frame arrived on the current socket.
    pub fn confirmed(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.attempt_number = 0;
        self.last_ping_sent_at = None;
        true
    }

    /// The socket closed or errored, or keep-alive failed.
    pub fn socket_lost(&mut self) -> AfterLoss {
        self.last_ping_sent_at = None;
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return AfterLoss::Ignored;
        }
        self.attempt_number += 1;
        match self.backoff.delay_for(self.attempt_number) {
            Some(delay) => {
                self.state = ConnectionState::Reconnecting(self.attempt_number);
                AfterLoss::Retry {
                    attempt: self.attempt_number,
                    delay,
                }
            }
            None => {
                self.state = ConnectionState::Disconnected;
                AfterLoss::GiveUp
            }
        }
    }

    /// The reconnect timer fired; returns whether a new socket should open.
    pub fn retry_elapsed(&mut self) -> bool {
        if !matches!(self.state, ConnectionState::Reconnecting(_)) {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempt_number = 0;
        self.last_ping_sent_at = None;
    }

    pub fn ping_sent(&mut self, at: Instant) {
        self.last_ping_sent_at = Some(at);
    }

    pub fn pong_received(&mut self) {
        self.last_ping_sent_at = None;
    }
}
