//! "Brutal" congestion control.
//!
//! A fixed-bandwidth sender: the congestion window tracks
//! `rate * rtt * gain / ack_rate` regardless of loss, where `rate` is the
//! receive bandwidth the server advertised during the handshake. The ack
//! rate is estimated over a short sliding window of acked/lost byte counts
//! so sustained loss inflates the window just enough to keep goodput at
//! the configured rate.
//!
//! quinn builds controllers from a factory at dial time, before the
//! handshake has revealed the server's rate, so the factory carries a
//! shared cell that the client fills in once the `ServerHello` arrives.
//! Until then the controller behaves like a plain initial window.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use quinn_proto::congestion::{Controller, ControllerFactory};
use quinn_proto::RttEstimator;

/// Sliding-window slots for the ack-rate estimate, one second each.
const ACK_RATE_SLOTS: usize = 4;
const SLOT_DURATION: Duration = Duration::from_secs(1);

/// Ack rate is floored here so a lossy path cannot inflate the window
/// without bound.
const MIN_ACK_RATE: f64 = 0.8;

/// Window gain over the ideal `rate * rtt` product.
const CWND_GAIN: f64 = 1.5;

/// Absolute window floor in bytes.
const MIN_WINDOW: u64 = 10_240;

/// Initial window in packets, used until the rate is known.
const INITIAL_WINDOW_PACKETS: u64 = 32;

/// Factory installed into the QUIC transport config; shared by every
/// connection the client dials.
#[derive(Debug)]
pub struct BrutalConfig {
    bandwidth: Arc<AtomicU64>,
}

impl BrutalConfig {
    /// `bandwidth` is the bytes-per-second cell the client updates after
    /// each successful handshake.
    pub fn new(bandwidth: Arc<AtomicU64>) -> Self {
        Self { bandwidth }
    }
}

impl ControllerFactory for BrutalConfig {
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        Box::new(BrutalSender {
            bandwidth: self.bandwidth.clone(),
            mtu: current_mtu,
            rtt: Duration::ZERO,
            slots: [AckSlot::default(); ACK_RATE_SLOTS],
            slot_index: 0,
            slot_start: now,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct AckSlot {
    acked: u64,
    lost: u64,
}

#[derive(Debug, Clone)]
pub struct BrutalSender {
    bandwidth: Arc<AtomicU64>,
    mtu: u16,
    rtt: Duration,
    slots: [AckSlot; ACK_RATE_SLOTS],
    slot_index: usize,
    slot_start: Instant,
}

impl BrutalSender {
    fn advance_slots(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.slot_start);
        if elapsed >= SLOT_DURATION * ACK_RATE_SLOTS as u32 {
            self.slots = [AckSlot::default(); ACK_RATE_SLOTS];
            self.slot_start = now;
            return;
        }
        let mut start = self.slot_start;
        while now.saturating_duration_since(start) >= SLOT_DURATION {
            self.slot_index = (self.slot_index + 1) % ACK_RATE_SLOTS;
            self.slots[self.slot_index] = AckSlot::default();
            start += SLOT_DURATION;
        }
        self.slot_start = start;
    }

    fn ack_rate(&self) -> f64 {
        let mut acked = 0u64;
        let mut lost = 0u64;
        for slot in &self.slots {
            acked += slot.acked;
            lost += slot.lost;
        }
        // Too few samples to judge the path.
        if acked + lost < 10 * self.mtu as u64 {
            return 1.0;
        }
        let rate = acked as f64 / (acked + lost) as f64;
        rate.max(MIN_ACK_RATE)
    }
}

impl Controller for BrutalSender {
    fn on_ack(
        &mut self,
        now: Instant,
        _sent: Instant,
        bytes: u64,
        _app_limited: bool,
        rtt: &RttEstimator,
    ) {
        self.advance_slots(now);
        self.slots[self.slot_index].acked += bytes;
        self.rtt = rtt.get();
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        _sent: Instant,
        _is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
        // Loss does not shrink the window; it only feeds the ack rate.
        self.advance_slots(now);
        self.slots[self.slot_index].lost += lost_bytes;
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.mtu = new_mtu;
    }

    fn window(&self) -> u64 {
        let rate = self.bandwidth.load(Ordering::Relaxed);
        if rate == 0 {
            return self.initial_window();
        }
        let rtt = self.rtt.max(Duration::from_millis(1));
        let window = rate as f64 * rtt.as_secs_f64() * CWND_GAIN / self.ack_rate();
        (window as u64).max(MIN_WINDOW)
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }

    fn initial_window(&self) -> u64 {
        (INITIAL_WINDOW_PACKETS * self.mtu as u64).max(MIN_WINDOW)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_sender(rate: u64) -> (BrutalSender, Arc<AtomicU64>) {
        let bandwidth = Arc::new(AtomicU64::new(rate));
        let factory = Arc::new(BrutalConfig::new(bandwidth.clone()));
        let controller = factory.build(Instant::now(), 1200);
        let sender = controller
            .into_any()
            .downcast::<BrutalSender>()
            .expect("factory builds a BrutalSender");
        (*sender, bandwidth)
    }

    #[test]
    fn unknown_rate_falls_back_to_initial_window() {
        let (sender, _) = build_sender(0);
        assert_eq!(sender.window(), sender.initial_window());
    }

    #[test]
    fn window_tracks_rate_and_rtt() {
        let (mut sender, bandwidth) = build_sender(0);
        bandwidth.store(6_250_000, Ordering::Relaxed); // 50 Mbps
        sender.rtt = Duration::from_millis(100);
        // 6_250_000 B/s * 0.1 s * 1.5
        assert_eq!(sender.window(), 937_500);

        bandwidth.store(12_500_000, Ordering::Relaxed);
        assert_eq!(sender.window(), 1_875_000);
    }

    #[test]
    fn loss_inflates_window_up_to_the_floor() {
        let (mut sender, _) = build_sender(6_250_000);
        sender.rtt = Duration::from_millis(100);
        let baseline = sender.window();

        // Half of everything lost; ack rate clamps at MIN_ACK_RATE.
        let now = Instant::now();
        sender.slots[0].acked = 1_000_000;
        sender.slots[0].lost = 1_000_000;
        sender.slot_start = now;
        let inflated = sender.window();
        assert_eq!(inflated, (baseline as f64 / MIN_ACK_RATE) as u64);
    }

    #[test]
    fn sparse_samples_do_not_skew_ack_rate() {
        let (mut sender, _) = build_sender(6_250_000);
        sender.slots[0].acked = 10;
        sender.slots[0].lost = 90;
        assert_eq!(sender.ack_rate(), 1.0);
    }
}
