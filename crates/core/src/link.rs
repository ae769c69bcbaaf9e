//! Delay accounting for simulated links.
//!
//! Every remote call in the system prices its timing through a [`LinkModel`]:
//! half the round-trip time for each direction of propagation, plus a
//! transmission delay proportional to payload size. Intra-zone (BLE-like)
//! and inter-zone (Wi-Fi-like) links differ only in their numbers.

use std::time::Duration;

/// Immutable RTT/bitrate pair for one simulated link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkModel {
    rtt_millis: u64,
    bit_rate_kbps: u64,
}

impl LinkModel {
    /// Panics if `bit_rate_kbps` is zero.
    pub fn new(rtt_millis: u64, bit_rate_kbps: u64) -> Self {
        assert!(bit_rate_kbps > 0, "link bitrate must be positive");
        LinkModel {
            rtt_millis,
            bit_rate_kbps,
        }
    }

    /// One-way propagation time, half the round trip.
    pub fn half_rtt(&self) -> Duration {
        Duration::from_millis(self.rtt_millis / 2)
    }

    /// Transmission time for `size_bytes`, in whole simulated milliseconds.
    ///
    /// `size_bytes * 8 / bit_rate_kbps` with integer truncation: a payload
    /// small relative to the bitrate costs 0ms. The truncated value is part
    /// of the delay contract; callers must not round it back up.
    pub fn transmit_delay(&self, size_bytes: u64) -> Duration {
        Duration::from_millis(size_bytes * 8 / self.bit_rate_kbps)
    }

    /// Cost of moving a `size_bytes` payload one way across the link.
    pub fn one_way(&self, size_bytes: u64) -> Duration {
        self.half_rtt() + self.transmit_delay(size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_rtt_truncates_odd_round_trips() {
        assert_eq!(
            LinkModel::new(100, 2000).half_rtt(),
            Duration::from_millis(50)
        );
        assert_eq!(LinkModel::new(5, 2000).half_rtt(), Duration::from_millis(2));
    }

    #[test]
    fn transmit_delay_is_bits_over_kbps() {
        let link = LinkModel::new(100, 2000);
        assert_eq!(
            link.transmit_delay(8000),
            Duration::from_millis(32),
            "8000 bytes at 2000kbps is 32ms"
        );
    }

    #[test]
    fn small_payloads_truncate_to_zero() {
        let link = LinkModel::new(100, 2000);
        assert_eq!(link.transmit_delay(100), Duration::ZERO);
        assert_eq!(link.one_way(100), Duration::from_millis(50));
    }

    #[test]
    fn one_way_sums_propagation_and_transmission() {
        let link = LinkModel::new(100, 2000);
        assert_eq!(link.one_way(8000), Duration::from_millis(82));
    }

    #[test]
    #[should_panic(expected = "bitrate must be positive")]
    fn rejects_zero_bitrate() {
        let _ = LinkModel::new(100, 0);
    }
}
