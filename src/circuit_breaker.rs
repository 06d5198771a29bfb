//! Circuit breaker for optional data channels.
//!
//! Each channel (second bars, minute bars, level-touch writes) tracks its own
//! health. Repeated failures degrade a channel, then cool it down for a while;
//! a structural failure such as a missing table disables it for the lifetime
//! of the breaker.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Health state of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Usable
    Healthy,
    /// Failing but still tried
    Degraded,
    /// Skipped until the cooldown elapses
    CoolingDown,
    /// Never tried again
    Disabled,
}

#[derive(Debug, Clone)]
struct ChannelHealth {
    state: ChannelState,
    consecutive_failures: u32,
    recent: VecDeque<bool>,
    cooldown_start: Option<Instant>,
    disabled_reason: Option<String>,
}

impl ChannelHealth {
    fn new() -> Self {
        Self {
            state: ChannelState::Healthy,
            consecutive_failures: 0,
            recent: VecDeque::new(),
            cooldown_start: None,
            disabled_reason: None,
        }
    }

    fn push(&mut self, success: bool, window: usize) {
        self.recent.push_back(success);
        while self.recent.len() > window {
            self.recent.pop_front();
        }
    }

    fn success_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 1.0;
        }
        self.recent.iter().filter(|&&ok| ok).count() as f64 / self.recent.len() as f64
    }
}

/// Snapshot of a channel for reporting.
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub state: ChannelState,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub attempts: usize,
    pub disabled_reason: Option<String>,
}

/// Per-channel circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    channels: HashMap<String, ChannelHealth>,
    failure_threshold: u32,
    cooldown: Duration,
    window: usize,
    min_success_rate: f64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_seconds: u64, window: usize) -> Self {
        Self {
            channels: HashMap::new(),
            failure_threshold: failure_threshold.max(1),
            cooldown: Duration::from_secs(cooldown_seconds),
            window: window.max(1),
            min_success_rate: 0.3,
        }
    }

    #[instrument(skip(self), fields(channel = %channel))]
    pub fn record_success(&mut self, channel: &str) {
        let window = self.window;
        let health = self.health_mut(channel);
        if health.state == ChannelState::Disabled {
            return;
        }
        health.consecutive_failures = 0;
        health.push(true, window);
        if health.state == ChannelState::Degraded && health.success_rate() > 0.7 {
            health.state = ChannelState::Healthy;
            debug!("Channel {} recovered", channel);
        }
    }

    #[instrument(skip(self), fields(channel = %channel))]
    pub fn record_failure(&mut self, channel: &str) {
        let (threshold, window, min_rate) = (self.failure_threshold, self.window, self.min_success_rate);
        let health = self.health_mut(channel);
        if health.state == ChannelState::Disabled {
            return;
        }
        health.consecutive_failures += 1;
        health.push(false, window);

        match health.state {
            ChannelState::Healthy if health.consecutive_failures >= threshold => {
                health.state = ChannelState::Degraded;
                warn!("Channel {} degraded after {} consecutive failures", channel, health.consecutive_failures);
            }
            ChannelState::Degraded
                if health.consecutive_failures >= threshold * 2
                    || (health.recent.len() >= window && health.success_rate() < min_rate) =>
            {
                health.state = ChannelState::CoolingDown;
                health.cooldown_start = Some(Instant::now());
                warn!("Channel {} cooling down: {} failures, {:.0}% success",
                      channel, health.consecutive_failures, health.success_rate() * 100.0);
            }
            _ => {}
        }
    }

    /// Permanently stops attempts on a channel.
    pub fn disable(&mut self, channel: &str, reason: &str) {
        let health = self.health_mut(channel);
        if health.state != ChannelState::Disabled {
            warn!("Channel {} disabled: {}", channel, reason);
        }
        health.state = ChannelState::Disabled;
        health.disabled_reason = Some(reason.to_string());
    }

    /// Whether the channel may be attempted now.
    pub fn is_available(&mut self, channel: &str) -> bool {
        let cooldown = self.cooldown;
        let health = self.health_mut(channel);
        match health.state {
            ChannelState::Healthy | ChannelState::Degraded => true,
            ChannelState::Disabled => false,
            ChannelState::CoolingDown => match health.cooldown_start {
                Some(start) if start.elapsed() < cooldown => false,
                _ => {
                    health.state = ChannelState::Degraded;
                    health.cooldown_start = None;
                    health.consecutive_failures = 0;
                    debug!("Channel {} cooldown expired", channel);
                    true
                }
            },
        }
    }

    pub fn state(&self, channel: &str) -> ChannelState {
        self.channels
            .get(channel)
            .map(|h| h.state.clone())
            .unwrap_or(ChannelState::Healthy)
    }

    pub fn stats(&self) -> HashMap<String, ChannelStats> {
        self.channels
            .iter()
            .map(|(name, h)| {
                (name.clone(), ChannelStats {
                    state: h.state.clone(),
                    consecutive_failures: h.consecutive_failures,
                    success_rate: h.success_rate(),
                    attempts: h.recent.len(),
                    disabled_reason: h.disabled_reason.clone(),
                })
            })
            .collect()
    }

    fn health_mut(&mut self, channel: &str) -> &mut ChannelHealth {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(ChannelHealth::new)
    }
}
