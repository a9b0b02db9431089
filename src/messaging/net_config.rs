use std::time::Duration;
use anyhow::bail;
use crate::messaging::packet_tracker::MAX_UNACKED_HISTORY;
use crate::util::byte_buffer::Endianness;

#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Byte order on the wire. Both peers must agree on this, there is no negotiation.
    pub endianness: Endianness,

    /// Interval between regular flushes of a connection's outgoing queues. Queued data that
    ///  fills a whole packet is sent regardless.
    pub net_tick_interval: Duration,
    /// A connection sends an empty packet if nothing was sent for this long, so that the peer's
    ///  acks and timeout detection keep working on idle connections
    pub heartbeat_interval: Duration,
    /// A connection is considered timed out if nothing was received for this long. This is
    ///  advisory, the application decides what to do about it.
    pub connection_timeout: Duration,

    /// weight of a new sample in the RTT moving average, >0 and <= 1
    pub rtt_blend_factor: f64,

    /// Minimum time between two transmissions of the same unconfirmed reliable message. With
    ///  `Duration::ZERO`, unconfirmed reliables are resent on every net tick.
    pub reliable_resend_delay: Duration,

    /// Upper limit for the number of packets a connection sends in a single flush. Data that
    ///  does not fit is deferred to the next flush.
    pub max_packets_per_flush: usize,
    /// Enqueueing a reliable message is refused while this many reliable messages are
    ///  unconfirmed
    pub max_pending_reliables: usize,

    /// The number of recently processed reliable ids that a connection remembers for detecting
    ///  duplicates. This must cover all reliable ids that can be in flight at the same time.
    pub processed_reliable_history: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig::new()
    }
}

impl NetConfig {
    pub fn new() -> NetConfig {
        NetConfig {
            endianness: Endianness::Little,
            net_tick_interval: Duration::from_millis(33),
            heartbeat_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(10),
            rtt_blend_factor: 0.01,
            reliable_resend_delay: Duration::ZERO,
            max_packets_per_flush: 8,
            max_pending_reliables: 4096,
            processed_reliable_history: 8192,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.net_tick_interval.is_zero() {
            bail!("net tick interval must be positive");
        }
        if self.heartbeat_interval < self.net_tick_interval {
            bail!("heartbeat interval {:?} is shorter than the net tick interval {:?}", self.heartbeat_interval, self.net_tick_interval);
        }
        if self.connection_timeout <= self.heartbeat_interval {
            bail!("connection timeout {:?} must be longer than the heartbeat interval {:?}", self.connection_timeout, self.heartbeat_interval);
        }
        if !(self.rtt_blend_factor > 0.0 && self.rtt_blend_factor <= 1.0) {
            bail!("RTT blend factor must be in (0, 1], was {}", self.rtt_blend_factor);
        }
        if self.max_packets_per_flush == 0 {
            bail!("max packets per flush must be positive");
        }
        if self.max_pending_reliables == 0 || self.max_pending_reliables > u16::MAX as usize / 4 {
            bail!("max pending reliables must be between 1 and {}, was {}", u16::MAX / 4, self.max_pending_reliables);
        }
        if self.processed_reliable_history < self.max_pending_reliables {
            bail!("processed reliable history ({}) must cover max pending reliables ({})", self.processed_reliable_history, self.max_pending_reliables);
        }
        if self.processed_reliable_history > u16::MAX as usize / 2 {
            bail!("processed reliable history must not exceed half the reliable id space, was {}", self.processed_reliable_history);
        }
        if self.max_packets_per_flush > MAX_UNACKED_HISTORY / 2 {
            bail!("max packets per flush must not exceed {}, was {}", MAX_UNACKED_HISTORY / 2, self.max_packets_per_flush);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        assert!(NetConfig::new().validate().is_ok());
    }

    #[rstest]
    #[case::zero_tick(|c: &mut NetConfig| c.net_tick_interval = Duration::ZERO)]
    #[case::heartbeat_below_tick(|c: &mut NetConfig| c.heartbeat_interval = Duration::from_millis(1))]
    #[case::timeout_below_heartbeat(|c: &mut NetConfig| c.connection_timeout = Duration::from_millis(500))]
    #[case::zero_blend(|c: &mut NetConfig| c.rtt_blend_factor = 0.0)]
    #[case::blend_above_one(|c: &mut NetConfig| c.rtt_blend_factor = 1.5)]
    #[case::blend_nan(|c: &mut NetConfig| c.rtt_blend_factor = f64::NAN)]
    #[case::zero_packets(|c: &mut NetConfig| c.max_packets_per_flush = 0)]
    #[case::too_many_packets(|c: &mut NetConfig| c.max_packets_per_flush = 17)]
    #[case::zero_pending(|c: &mut NetConfig| c.max_pending_reliables = 0)]
    #[case::history_too_short(|c: &mut NetConfig| c.processed_reliable_history = 100)]
    #[case::history_too_long(|c: &mut NetConfig| c.processed_reliable_history = 40000)]
    fn test_validate_rejects(#[case] modify: fn(&mut NetConfig)) {
        let mut config = NetConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
