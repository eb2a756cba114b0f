//! "Brutal" congestion control
// (c) 2024 Ross Younger
//!
//! Loss-based congestion control collapses on adversarial networks: a few
//! percent of random loss and Cubic will crawl. Brutal inverts the contract.
//! The operator declares the link capacity up front; the controller's job is
//! to saturate it, not to probe for it. Loss never reduces the sending rate.
//! Instead, the observed delivery rate inflates the window (bounded at 2x) so
//! that goodput stays close to `rate x (1 - loss)`.
//!
//! The negotiated rate is `min(client declared up, server granted)`; see the
//! session setup in [`crate::tunnel`].

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use quinn_proto::congestion::{Controller, ControllerFactory};
use quinn_proto::RttEstimator;

/// Window floor used before we have an RTT sample, and whenever the
/// computed window would be degenerate.
const BASE_WINDOW: u64 = 10240;

/// Window gain over the bandwidth-delay product. Matches the deployed
/// servers, which assume clients keep 1.5 BDP in flight.
const WINDOW_GAIN: f64 = 1.5;

/// Delivery-rate samples are kept in one-second slots this many seconds back.
const SLOT_COUNT: usize = 5;

/// Below this many acked+lost bytes the delivery rate estimate is noise and
/// we treat delivery as perfect.
const MIN_SAMPLE_BYTES: u64 = 65536;

/// Floor on the delivery rate estimate. Caps loss compensation at 2x.
const MIN_ACK_RATE: f64 = 0.5;

/// Configuration (and [`ControllerFactory`]) for [`Brutal`].
///
/// The pacing target lives in a shared cell rather than a plain field: the
/// server's granted rate arrives in the hello exchange, which itself rides
/// the connection this factory was installed into. The connection starts out
/// pacing at the client's declared rate and is clamped down once the grant
/// is known, via [`BrutalConfig::set_bandwidth`].
#[derive(Debug, Clone)]
pub struct BrutalConfig {
    bandwidth_bps: Arc<AtomicU64>,
}

impl BrutalConfig {
    /// Constructor. `bandwidth_bps` is the initial pacing target in bytes
    /// per second, normally the client's declared up rate.
    #[must_use]
    pub fn new(bandwidth_bps: u64) -> Self {
        Self {
            bandwidth_bps: Arc::new(AtomicU64::new(bandwidth_bps)),
        }
    }

    /// Replaces the pacing target. Takes effect on the next window query.
    pub fn set_bandwidth(&self, bandwidth_bps: u64) {
        self.bandwidth_bps.store(bandwidth_bps, Ordering::Relaxed);
    }
}

impl ControllerFactory for BrutalConfig {
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        Box::new(Brutal::new(self.bandwidth_bps.clone(), now, current_mtu))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    sec: u64,
    acked: u64,
    lost: u64,
}

/// Send-side congestion controller pacing to a fixed declared rate
#[derive(Debug, Clone)]
pub struct Brutal {
    bandwidth_bps: Arc<AtomicU64>,
    epoch: Instant,
    rtt: Option<Duration>,
    slots: [Slot; SLOT_COUNT],
    ack_rate: f64,
    current_mtu: u64,
}

impl Brutal {
    fn new(bandwidth_bps: Arc<AtomicU64>, now: Instant, current_mtu: u16) -> Self {
        Self {
            bandwidth_bps,
            epoch: now,
            rtt: None,
            slots: [Slot::default(); SLOT_COUNT],
            ack_rate: 1.0,
            current_mtu: u64::from(current_mtu),
        }
    }

    fn slot_mut(&mut self, now: Instant) -> &mut Slot {
        let sec = now.saturating_duration_since(self.epoch).as_secs();
        let slot = &mut self.slots[usize::try_from(sec).unwrap_or(0) % SLOT_COUNT];
        if slot.sec != sec {
            // The slot has lapped; start a fresh second.
            *slot = Slot {
                sec,
                acked: 0,
                lost: 0,
            };
        }
        slot
    }

    fn update_ack_rate(&mut self, now: Instant) {
        let current_sec = now.saturating_duration_since(self.epoch).as_secs();
        let mut acked = 0u64;
        let mut lost = 0u64;
        for slot in &self.slots {
            // Only count slots still within the window.
            if slot.sec + (SLOT_COUNT as u64) > current_sec {
                acked += slot.acked;
                lost += slot.lost;
            }
        }
        if acked + lost < MIN_SAMPLE_BYTES {
            self.ack_rate = 1.0;
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = acked as f64 / (acked + lost) as f64;
        self.ack_rate = rate.max(MIN_ACK_RATE);
    }
}

impl Controller for Brutal {
    fn on_ack(
        &mut self,
        now: Instant,
        _sent: Instant,
        bytes: u64,
        _app_limited: bool,
        rtt: &RttEstimator,
    ) {
        self.rtt = Some(rtt.get());
        self.slot_mut(now).acked += bytes;
        self.update_ack_rate(now);
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        _sent: Instant,
        _is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
        // Loss is recorded for the delivery-rate estimate but never
        // shrinks the window.
        self.slot_mut(now).lost += lost_bytes;
        self.update_ack_rate(now);
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.current_mtu = u64::from(new_mtu);
    }

    fn window(&self) -> u64 {
        let Some(rtt) = self.rtt else {
            return self.initial_window();
        };
        let bps = self.bandwidth_bps.load(Ordering::Relaxed);
        window_for(bps, rtt, self.ack_rate).max(BASE_WINDOW)
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }

    fn initial_window(&self) -> u64 {
        BASE_WINDOW.max(self.current_mtu * 2)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Core window computation: 1.5 BDP scaled up by the observed loss
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn window_for(bandwidth_bps: u64, rtt: Duration, ack_rate: f64) -> u64 {
    if rtt.is_zero() {
        return BASE_WINDOW;
    }
    (bandwidth_bps as f64 * rtt.as_secs_f64() * WINDOW_GAIN / ack_rate) as u64
}

#[cfg(test)]
mod test {
    use super::*;

    fn brutal(bps: u64, now: Instant) -> Brutal {
        Brutal::new(Arc::new(AtomicU64::new(bps)), now, 1252)
    }

    #[test]
    fn window_is_bdp_times_gain() {
        // 1 MB/s at 100ms RTT: BDP 100_000, x1.5 gain
        let w = window_for(1_000_000, Duration::from_millis(100), 1.0);
        assert_eq!(w, 150_000);
    }

    #[test]
    fn loss_compensation_is_capped() {
        let clean = window_for(1_000_000, Duration::from_millis(100), 1.0);
        let lossy = window_for(1_000_000, Duration::from_millis(100), MIN_ACK_RATE);
        assert_eq!(lossy, clean * 2);
    }

    #[test]
    fn zero_rtt_degenerates_to_base() {
        assert_eq!(window_for(1_000_000, Duration::ZERO, 1.0), BASE_WINDOW);
    }

    #[test]
    fn negotiated_rate_applies_to_live_controllers() {
        let now = Instant::now();
        let config = Arc::new(BrutalConfig::new(2_000_000));
        let c = config.clone().build(now, 1252);
        // The grant arrives after the controller was built.
        config.set_bandwidth(1_000_000);
        let brutal = c.into_any().downcast::<Brutal>().unwrap();
        assert_eq!(brutal.bandwidth_bps.load(Ordering::Relaxed), 1_000_000);
    }

    #[test]
    fn loss_never_shrinks_window() {
        let now = Instant::now();
        let mut b = brutal(1_000_000, now);
        b.rtt = Some(Duration::from_millis(100));
        let before = b.window();
        b.on_congestion_event(now, now, true, 50_000);
        assert!(b.window() >= before);
    }

    #[test]
    fn ack_rate_tracks_observed_loss() {
        let now = Instant::now();
        let mut b = brutal(1_000_000, now);
        // Push enough samples past the noise threshold: 75% delivered.
        b.slot_mut(now).acked = 300_000;
        b.slot_mut(now).lost = 100_000;
        b.update_ack_rate(now);
        assert!((b.ack_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn sparse_samples_treated_as_clean() {
        let now = Instant::now();
        let mut b = brutal(1_000_000, now);
        b.slot_mut(now).acked = 100;
        b.slot_mut(now).lost = 100;
        b.update_ack_rate(now);
        assert!((b.ack_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stale_slots_age_out() {
        let now = Instant::now();
        let mut b = brutal(1_000_000, now);
        b.slot_mut(now).lost = 1_000_000;
        b.slot_mut(now).acked = 1_000_000;
        // Ten seconds later those samples are outside the window.
        let later = now + Duration::from_secs(10);
        b.update_ack_rate(later);
        assert!((b.ack_rate - 1.0).abs() < f64::EPSILON);
    }
}
