//! Connection and message throttling.
//!
//! Both throttlers are keyed token buckets: one bucket per remote IP for
//! inbound connection upgrades, one per peer for consensus messages. A zero
//! limit in [`ThrottleConfig`] disables the corresponding throttler.

use {
    crate::{config::ThrottleConfig, ids::PeerId},
    governor::{DefaultKeyedRateLimiter, Quota, RateLimiter},
    std::{net::IpAddr, num::NonZeroU32, time::Duration},
};

/// Limits how often a single IP may open an inbound connection.
pub struct InboundConnThrottler {
    limiter: Option<DefaultKeyedRateLimiter<IpAddr>>,
}

impl InboundConnThrottler {
    /// One upgrade per `cooldown` per IP. A zero cooldown allows everything.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            limiter: Quota::with_period(cooldown).map(RateLimiter::keyed),
        }
    }

    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self::new(Duration::from_millis(config.inbound_conn_cooldown_ms))
    }

    /// Whether a connection from `ip` may be upgraded now.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.limiter
            .as_ref()
            .map_or(true, |limiter| limiter.check_key(&ip).is_ok())
    }

    /// Drop buckets that are back to full capacity.
    pub fn prune(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
        }
    }
}

/// Decides whether a consensus message to or from a peer may pass.
pub trait MsgThrottler: Send + Sync {
    fn allow(&self, peer: &PeerId) -> bool;

    /// Forget state kept for `peer`.
    fn release(&self, _peer: &PeerId) {}
}

/// Lets every message through.
#[derive(Debug, Default)]
pub struct NoMsgThrottler;

impl MsgThrottler for NoMsgThrottler {
    fn allow(&self, _peer: &PeerId) -> bool {
        true
    }
}

/// Per-peer sustained rate with a burst allowance.
pub struct RateMsgThrottler {
    limiter: DefaultKeyedRateLimiter<PeerId>,
}

impl RateMsgThrottler {
    pub fn new(per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::keyed(Quota::per_second(per_second).allow_burst(burst)),
        }
    }
}

impl MsgThrottler for RateMsgThrottler {
    fn allow(&self, peer: &PeerId) -> bool {
        self.limiter.check_key(peer).is_ok()
    }

    fn release(&self, _peer: &PeerId) {
        self.limiter.retain_recent();
    }
}

/// Build a message throttler from a rate and burst; zero rate disables it.
/// A zero burst defaults to the rate.
pub fn msg_throttler(per_second: u32, burst: u32) -> Box<dyn MsgThrottler> {
    match NonZeroU32::new(per_second) {
        Some(rate) => {
            let burst = NonZeroU32::new(burst).unwrap_or(rate);
            Box::new(RateMsgThrottler::new(rate, burst))
        }
        None => Box::new(NoMsgThrottler),
    }
}

/// Inbound and outbound message throttlers for a network.
pub struct Throttlers {
    pub inbound_conns: InboundConnThrottler,
    pub inbound_msgs: Box<dyn MsgThrottler>,
    pub outbound_msgs: Box<dyn MsgThrottler>,
}

impl Throttlers {
    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self {
            inbound_conns: InboundConnThrottler::from_config(config),
            inbound_msgs: msg_throttler(config.inbound_msgs_per_sec, config.inbound_msg_burst),
            outbound_msgs: msg_throttler(config.outbound_msgs_per_sec, config.outbound_msg_burst),
        }
    }
}
