//! Loss-driven rate control.
//!
//! `RateController` consumes receiver feedback and turns it into the two
//! signals an encoder accepts: `ChannelParameters` on every report, and a new
//! target bitrate whenever the estimate moves. Loss is tracked in the same
//! 1/255 units `set_channel_parameters` takes, so what the encoder is told and
//! what drives the target never disagree.

use std::time::{Duration, Instant};

use venc_protocol::ChannelParameters;

/// One receiver report, as seen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverReport {
    pub packets_received: u32,
    pub packets_lost: u32,
    pub rtt_ms: i64,
}

impl ReceiverReport {
    /// Loss over this report in 1/255 units, rounded to nearest.
    pub fn packet_loss(&self) -> u8 {
        let lost = self.packets_lost as u64;
        let total = self.packets_received as u64 + lost;
        if total == 0 {
            return 0;
        }
        ((lost * 255 + total / 2) / total) as u8
    }

    pub fn channel_parameters(&self) -> ChannelParameters {
        ChannelParameters {
            packet_loss: self.packet_loss(),
            rtt_ms: self.rtt_ms,
        }
    }
}

/// Signals produced by one receiver report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateUpdate {
    /// Always present; forward to `set_channel_parameters`.
    pub channel: ChannelParameters,
    /// New target in kbps, only when it changed.
    pub target_bitrate_kbps: Option<u32>,
}

/// Configuration for the rate controller.
#[derive(Debug, Clone)]
pub struct RateControlConfig {
    pub min_bitrate_kbps: u32,
    /// Upper bound on the target. 0 means no limit, as in `VideoCodecSettings`.
    pub max_bitrate_kbps: u32,
    pub initial_bitrate_kbps: u32,
    /// Loss fraction above which the target is reduced (0.05 = 5%).
    pub loss_reduce_threshold: f64,
    /// Loss fraction below which the target may grow.
    pub loss_increase_threshold: f64,
    /// Sustained low-loss period required before each increase.
    pub increase_delay: Duration,
    pub reduce_factor: f64,
    pub increase_factor: f64,
}

impl Default for RateControlConfig {
    fn default() -> Self {
        Self {
            min_bitrate_kbps: 30,
            max_bitrate_kbps: 2_500,
            initial_bitrate_kbps: 500,
            loss_reduce_threshold: 0.05,
            loss_increase_threshold: 0.01,
            increase_delay: Duration::from_secs(10),
            reduce_factor: 0.8,
            increase_factor: 1.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LossBand {
    /// Loss high enough to back off.
    Congested,
    /// Between the thresholds; hold the target.
    Holding,
    /// Loss low enough that the target may grow.
    Clear,
}

/// Target bitrate limits. `max == None` is unbounded.
#[derive(Debug, Clone, Copy)]
struct Bounds {
    min: u32,
    max: Option<u32>,
}

impl Bounds {
    fn new(min: u32, max: u32) -> Self {
        let max = match max {
            0 => None,
            max if max < min => {
                tracing::warn!(
                    min_kbps = min,
                    max_kbps = max,
                    "max bitrate below min, raising max to min"
                );
                Some(min)
            }
            max => Some(max),
        };
        Self { min, max }
    }

    fn apply(&self, kbps: u32) -> u32 {
        let kbps = kbps.max(self.min);
        match self.max {
            Some(max) => kbps.min(max),
            None => kbps,
        }
    }
}

fn fraction_to_loss(fraction: f64) -> u8 {
    (fraction.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Tracks network conditions and recommends encoder rate changes.
pub struct RateController {
    bounds: Bounds,
    reduce_above: u8,
    increase_below: u8,
    increase_delay: Duration,
    reduce_factor: f64,
    increase_factor: f64,
    current_bitrate_kbps: u32,
    channel: ChannelParameters,
    /// Start of the current run of clear reports.
    clear_since: Option<Instant>,
    reports_received: u64,
}

impl RateController {
    pub fn new(config: RateControlConfig) -> Self {
        let bounds = Bounds::new(config.min_bitrate_kbps, config.max_bitrate_kbps);
        let initial = bounds.apply(config.initial_bitrate_kbps);
        tracing::info!(
            initial_kbps = initial,
            min_kbps = bounds.min,
            max_kbps = ?bounds.max,
            "rate controller created"
        );
        Self {
            bounds,
            reduce_above: fraction_to_loss(config.loss_reduce_threshold),
            increase_below: fraction_to_loss(config.loss_increase_threshold),
            increase_delay: config.increase_delay,
            reduce_factor: config.reduce_factor,
            increase_factor: config.increase_factor,
            current_bitrate_kbps: initial,
            channel: ChannelParameters::default(),
            clear_since: None,
            reports_received: 0,
        }
    }

    fn band(&self, packet_loss: u8) -> LossBand {
        if packet_loss > self.reduce_above {
            LossBand::Congested
        } else if packet_loss < self.increase_below {
            LossBand::Clear
        } else {
            LossBand::Holding
        }
    }

    /// Process one receiver report.
    ///
    /// `now` is passed in so tests control time.
    pub fn on_report(&mut self, report: ReceiverReport, now: Instant) -> RateUpdate {
        self.reports_received += 1;
        self.channel = report.channel_parameters();
        let old = self.current_bitrate_kbps;

        let band = self.band(self.channel.packet_loss);
        match band {
            LossBand::Congested => {
                self.clear_since = None;
                self.current_bitrate_kbps = self.scaled(self.reduce_factor);
            }
            LossBand::Holding => self.clear_since = None,
            LossBand::Clear => match self.clear_since {
                Some(since) if now.duration_since(since) >= self.increase_delay => {
                    self.current_bitrate_kbps = self.scaled(self.increase_factor);
                    self.clear_since = Some(now);
                }
                Some(_) => {}
                None => self.clear_since = Some(now),
            },
        }

        if self.current_bitrate_kbps != old {
            tracing::debug!(
                old_kbps = old,
                new_kbps = self.current_bitrate_kbps,
                packet_loss = self.channel.packet_loss,
                ?band,
                "target bitrate changed"
            );
        } else {
            tracing::trace!(
                packet_loss = self.channel.packet_loss,
                rtt_ms = self.channel.rtt_ms,
                ?band,
                "receiver report"
            );
        }

        RateUpdate {
            channel: self.channel,
            target_bitrate_kbps: (self.current_bitrate_kbps != old)
                .then_some(self.current_bitrate_kbps),
        }
    }

    fn scaled(&self, factor: f64) -> u32 {
        let scaled = (self.current_bitrate_kbps as f64 * factor) as u32;
        self.bounds.apply(scaled)
    }

    pub fn current_bitrate_kbps(&self) -> u32 {
        self.current_bitrate_kbps
    }

    /// Channel state from the last report.
    pub fn channel_parameters(&self) -> ChannelParameters {
        self.channel
    }

    pub fn reports_received(&self) -> u64 {
        self.reports_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(initial: u32) -> RateController {
        RateController::new(RateControlConfig {
            initial_bitrate_kbps: initial,
            ..RateControlConfig::default()
        })
    }

    fn report(received: u32, lost: u32, rtt_ms: i64) -> ReceiverReport {
        ReceiverReport {
            packets_received: received,
            packets_lost: lost,
            rtt_ms,
        }
    }

    #[test]
    fn packet_loss_in_255ths() {
        assert_eq!(report(100, 0, 0).packet_loss(), 0);
        assert_eq!(report(0, 100, 0).packet_loss(), 255);
        assert_eq!(report(90, 10, 0).packet_loss(), 26);
        // 2 / 102 of 255 = 5.0
        assert_eq!(report(100, 2, 0).packet_loss(), 5);
        assert_eq!(report(0, 0, 0).packet_loss(), 0);
        assert_eq!(report(u32::MAX, u32::MAX, 0).packet_loss(), 128);
    }

    #[test]
    fn high_loss_reduces_bitrate() {
        let mut rc = controller(500);
        let update = rc.on_report(report(90, 10, 50), Instant::now());
        assert_eq!(update.target_bitrate_kbps, Some(400));
        assert_eq!(rc.current_bitrate_kbps(), 400);
    }

    #[test]
    fn repeated_high_loss_keeps_reducing() {
        let mut rc = controller(500);
        let now = Instant::now();

        rc.on_report(report(50, 50, 200), now);
        assert_eq!(rc.current_bitrate_kbps(), 400);
        rc.on_report(report(50, 50, 200), now + Duration::from_secs(1));
        assert_eq!(rc.current_bitrate_kbps(), 320);
        rc.on_report(report(50, 50, 200), now + Duration::from_secs(2));
        assert_eq!(rc.current_bitrate_kbps(), 256);
    }

    #[test]
    fn sustained_low_loss_increases_bitrate() {
        let mut rc = controller(500);
        let now = Instant::now();

        assert_eq!(rc.on_report(report(100, 0, 30), now).target_bitrate_kbps, None);
        let update = rc.on_report(report(100, 0, 30), now + Duration::from_secs(5));
        assert_eq!(update.target_bitrate_kbps, None);
        let update = rc.on_report(report(100, 0, 30), now + Duration::from_secs(10));
        assert_eq!(update.target_bitrate_kbps, Some(550));
    }

    #[test]
    fn moderate_loss_resets_increase_timer() {
        let mut rc = RateController::new(RateControlConfig {
            initial_bitrate_kbps: 500,
            increase_delay: Duration::from_secs(5),
            ..RateControlConfig::default()
        });
        let now = Instant::now();

        rc.on_report(report(100, 0, 30), now);
        // 3% sits between the thresholds
        rc.on_report(report(97, 3, 30), now + Duration::from_secs(3));
        rc.on_report(report(100, 0, 30), now + Duration::from_secs(6));

        let update = rc.on_report(report(100, 0, 30), now + Duration::from_secs(10));
        assert_eq!(update.target_bitrate_kbps, None);
        let update = rc.on_report(report(100, 0, 30), now + Duration::from_secs(11));
        assert_eq!(update.target_bitrate_kbps, Some(550));
    }

    #[test]
    fn bitrate_clamped_to_bounds() {
        let mut rc = RateController::new(RateControlConfig {
            initial_bitrate_kbps: 40,
            min_bitrate_kbps: 32,
            ..RateControlConfig::default()
        });
        let now = Instant::now();
        rc.on_report(report(50, 50, 100), now);
        assert_eq!(rc.current_bitrate_kbps(), 32);
        let update = rc.on_report(report(50, 50, 100), now + Duration::from_secs(1));
        assert_eq!(update.target_bitrate_kbps, None);

        let mut rc = RateController::new(RateControlConfig {
            initial_bitrate_kbps: 2_400,
            increase_delay: Duration::from_secs(1),
            ..RateControlConfig::default()
        });
        rc.on_report(report(100, 0, 20), now);
        rc.on_report(report(100, 0, 20), now + Duration::from_secs(1));
        assert_eq!(rc.current_bitrate_kbps(), 2_500);
    }

    #[test]
    fn zero_max_means_unbounded() {
        let mut rc = RateController::new(RateControlConfig {
            min_bitrate_kbps: 100,
            max_bitrate_kbps: 0,
            initial_bitrate_kbps: 3_000,
            increase_delay: Duration::from_secs(1),
            ..RateControlConfig::default()
        });
        assert_eq!(rc.current_bitrate_kbps(), 3_000);

        let now = Instant::now();
        rc.on_report(report(100, 0, 20), now);
        let update = rc.on_report(report(100, 0, 20), now + Duration::from_secs(1));
        assert_eq!(update.target_bitrate_kbps, Some(3_300));

        // Reductions still stop at the minimum
        for i in 2..40 {
            rc.on_report(report(50, 50, 20), now + Duration::from_secs(i));
        }
        assert_eq!(rc.current_bitrate_kbps(), 100);
    }

    #[test]
    fn max_below_min_is_raised() {
        let rc = RateController::new(RateControlConfig {
            min_bitrate_kbps: 300,
            max_bitrate_kbps: 200,
            initial_bitrate_kbps: 500,
            ..RateControlConfig::default()
        });
        assert_eq!(rc.current_bitrate_kbps(), 300);
    }

    #[test]
    fn channel_parameters_reported_every_time() {
        let mut rc = controller(500);
        let update = rc.on_report(report(100, 2, 75), Instant::now());
        assert_eq!(update.target_bitrate_kbps, None);
        assert_eq!(
            update.channel,
            ChannelParameters {
                packet_loss: 5,
                rtt_ms: 75
            }
        );
        assert_eq!(rc.channel_parameters(), update.channel);
        assert_eq!(rc.reports_received(), 1);
    }

    #[test]
    fn zero_packets_no_crash() {
        let mut rc = controller(500);
        let update = rc.on_report(report(0, 0, 0), Instant::now());
        assert_eq!(update.target_bitrate_kbps, None);
        assert_eq!(update.channel.packet_loss, 0);
    }
}
