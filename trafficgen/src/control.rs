//! Runtime control of the generator.
//!
//! [`Control`] is a cloneable handle over the settings that may change while
//! the daemon runs: the enable flag, the anonymous interval bounds and the
//! DDoS controller. All of it sits behind one mutex. The generation loop
//! takes one [`Snapshot`] per tick; the control API mutates through the same
//! handle. Invalid requests are rejected without touching any state.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use metrics::gauge;
use rand::Rng;
use serde::Serialize;
use tracing::info;
use trafficgen_payload::RegionTable;

use crate::ddos::{self, Phase, Target};

/// Control requests that were rejected.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An interval bound was negative or not a number.
    #[error("Intervals must be finite and non-negative")]
    InvalidInterval,
    /// The lower interval bound exceeded the upper.
    #[error("min_interval must be less than or equal to max_interval")]
    InvertedInterval,
    /// The DDoS duration was not a positive number of seconds.
    #[error("Duration must be positive")]
    InvalidDuration,
}

#[derive(Debug)]
struct Settings {
    enabled: bool,
    min_interval: f64,
    max_interval: f64,
    ddos: ddos::Controller,
}

/// A consistent view of the settings for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Whether generation is enabled.
    pub enabled: bool,
    /// Lower bound of the anonymous sleep, seconds.
    pub min_interval: f64,
    /// Upper bound of the anonymous sleep, seconds.
    pub max_interval: f64,
    /// What the DDoS controller wants from this tick.
    pub ddos: Phase,
}

/// Reported by `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    /// Whether generation is enabled.
    pub traffic_enabled: bool,
    /// Lower bound of the anonymous sleep, seconds.
    pub min_interval: f64,
    /// Upper bound of the anonymous sleep, seconds.
    pub max_interval: f64,
    /// Whether a DDoS simulation is running.
    pub ddos_active: bool,
    /// Region of the running DDoS simulation.
    pub ddos_region: Option<String>,
    /// Seconds left in the running DDoS simulation, zero if none.
    pub ddos_remaining: f64,
    /// Number of in-progress flows.
    pub active_flows: usize,
}

/// Shared handle on the generator's runtime settings.
#[derive(Debug, Clone)]
pub struct Control {
    settings: Arc<Mutex<Settings>>,
    regions: Arc<RegionTable>,
    active_flows: Arc<AtomicUsize>,
}

impl Control {
    /// Create a new [`Control`].
    #[must_use]
    pub fn new(enabled: bool, min_interval: f64, max_interval: f64, regions: Arc<RegionTable>) -> Self {
        gauge!("traffic_generation_interval_seconds", "type" => "min").set(min_interval);
        gauge!("traffic_generation_interval_seconds", "type" => "max").set(max_interval);
        gauge!("ddos_simulation_active").set(0.0);
        Self {
            settings: Arc::new(Mutex::new(Settings {
                enabled,
                min_interval,
                max_interval,
                ddos: ddos::Controller::default(),
            })),
            regions,
            active_flows: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The region table DDoS targets are drawn from.
    #[must_use]
    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    /// Enable generation. Returns `false` if it already was.
    pub fn start(&self) -> bool {
        let mut settings = self.lock();
        let changed = !settings.enabled;
        settings.enabled = true;
        if changed {
            info!("traffic generation started");
        }
        changed
    }

    /// Disable generation. Returns `false` if it already was.
    pub fn stop(&self) -> bool {
        let mut settings = self.lock();
        let changed = settings.enabled;
        settings.enabled = false;
        if changed {
            info!("traffic generation stopped");
        }
        changed
    }

    /// Whether generation is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Replace the anonymous sleep bounds.
    ///
    /// # Errors
    ///
    /// Function will error, changing nothing, if either bound is negative or
    /// not finite, or if `min` exceeds `max`.
    pub fn update_interval(&self, min: f64, max: f64) -> Result<(), Error> {
        if !min.is_finite() || !max.is_finite() || min < 0.0 || max < 0.0 {
            return Err(Error::InvalidInterval);
        }
        if min > max {
            return Err(Error::InvertedInterval);
        }
        let mut settings = self.lock();
        settings.min_interval = min;
        settings.max_interval = max;
        drop(settings);

        gauge!("traffic_generation_interval_seconds", "type" => "min").set(min);
        gauge!("traffic_generation_interval_seconds", "type" => "max").set(max);
        info!("interval updated to [{min}, {max}]");
        Ok(())
    }

    /// Start a DDoS simulation lasting `duration_seconds`, replacing any
    /// running one.
    ///
    /// # Errors
    ///
    /// Function will error, changing nothing, if `duration_seconds` is not a
    /// positive finite number or if the deadline it implies is out of range.
    pub fn simulate_ddos<R>(
        &self,
        rng: &mut R,
        duration_seconds: f64,
        region: Option<&str>,
        now: Instant,
    ) -> Result<Target, Error>
    where
        R: Rng + ?Sized,
    {
        if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
            return Err(Error::InvalidDuration);
        }
        let duration =
            Duration::try_from_secs_f64(duration_seconds).map_err(|_| Error::InvalidDuration)?;
        let target = self
            .lock()
            .ddos
            .activate(rng, &self.regions, duration, region, now)
            .cloned()
            .ok_or(Error::InvalidDuration)?;
        gauge!("ddos_simulation_active").set(1.0);
        Ok(target)
    }

    /// Take the per-tick view, advancing the DDoS controller to `now`.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> Snapshot {
        let mut settings = self.lock();
        let ddos = settings.ddos.poll(now);
        if ddos == Phase::Ended {
            gauge!("ddos_simulation_active").set(0.0);
            gauge!("ddos_simulation_remaining_seconds").set(0.0);
        }
        Snapshot {
            enabled: settings.enabled,
            min_interval: settings.min_interval,
            max_interval: settings.max_interval,
            ddos,
        }
    }

    /// Publish the number of in-progress flows.
    pub fn set_active_flows(&self, count: usize) {
        self.active_flows.store(count, Ordering::Relaxed);
        gauge!("active_flows_total").set(count as f64);
    }

    /// Number of in-progress flows, as last published.
    #[must_use]
    pub fn active_flows(&self) -> usize {
        self.active_flows.load(Ordering::Relaxed)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self, now: Instant) -> Status {
        let settings = self.lock();
        let remaining = settings
            .ddos
            .remaining(now)
            .map_or(0.0, |remaining| remaining.as_secs_f64());
        gauge!("ddos_simulation_remaining_seconds").set(remaining);
        Status {
            traffic_enabled: settings.enabled,
            min_interval: settings.min_interval,
            max_interval: settings.max_interval,
            ddos_active: settings.ddos.is_active(),
            ddos_region: settings.ddos.target().map(|target| target.region.clone()),
            ddos_remaining: remaining,
            active_flows: self.active_flows(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::SmallRng};

    use super::*;

    fn control() -> Control {
        Control::new(true, 0.1, 3.0, Arc::new(RegionTable::builtin()))
    }

    #[test]
    fn invalid_intervals_change_nothing() {
        let control = control();
        let now = Instant::now();
        let before = control.status(now);

        assert_eq!(control.update_interval(2.0, 1.0), Err(Error::InvertedInterval));
        assert_eq!(control.update_interval(-1.0, 1.0), Err(Error::InvalidInterval));
        assert_eq!(control.update_interval(0.0, f64::NAN), Err(Error::InvalidInterval));
        assert_eq!(
            control.update_interval(0.0, f64::INFINITY),
            Err(Error::InvalidInterval)
        );
        assert_eq!(control.status(now), before);

        control.update_interval(0.5, 0.5).expect("equal bounds are fine");
        let snapshot = control.snapshot(now);
        assert!((snapshot.min_interval - 0.5).abs() < f64::EPSILON);
        assert!((snapshot.max_interval - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn start_and_stop_report_changes() {
        let control = control();
        assert!(!control.start());
        assert!(control.stop());
        assert!(!control.stop());
        assert!(!control.snapshot(Instant::now()).enabled);
        assert!(control.start());
        assert!(control.is_enabled());
    }

    #[test]
    fn ddos_requires_positive_duration() {
        let control = control();
        let mut rng = SmallRng::seed_from_u64(1);
        let now = Instant::now();
        for bad in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            assert_eq!(
                control.simulate_ddos(&mut rng, bad, None, now),
                Err(Error::InvalidDuration)
            );
        }
        assert!(!control.status(now).ddos_active);
    }

    #[test]
    fn ddos_rejects_durations_past_the_clock() {
        let control = control();
        let mut rng = SmallRng::seed_from_u64(3);
        let now = Instant::now();
        for huge in [1.8e19, 1e300] {
            assert_eq!(
                control.simulate_ddos(&mut rng, huge, Some("Europe"), now),
                Err(Error::InvalidDuration)
            );
        }
        let status = control.status(now);
        assert!(!status.ddos_active);
        assert_eq!(status.ddos_region, None);
        assert_eq!(control.snapshot(now).ddos, Phase::Idle);
    }

    #[test]
    fn ddos_status_and_expiry() {
        let control = control();
        let mut rng = SmallRng::seed_from_u64(2);
        let now = Instant::now();
        let target = control
            .simulate_ddos(&mut rng, 10.0, Some("Asia"), now)
            .expect("valid activation");
        assert_eq!(target.region, "Asia");

        let status = control.status(now + Duration::from_secs(4));
        assert!(status.ddos_active);
        assert_eq!(status.ddos_region.as_deref(), Some("Asia"));
        assert!((status.ddos_remaining - 6.0).abs() < 1e-6);

        assert_eq!(
            control.snapshot(now + Duration::from_secs(1)).ddos,
            Phase::Burst(target)
        );
        assert_eq!(control.snapshot(now + Duration::from_secs(10)).ddos, Phase::Ended);
        assert_eq!(control.snapshot(now + Duration::from_secs(11)).ddos, Phase::Idle);
        let status = control.status(now + Duration::from_secs(11));
        assert!(!status.ddos_active);
        assert_eq!(status.ddos_region, None);
        assert!(status.ddos_remaining.abs() < f64::EPSILON);
    }

    #[test]
    fn clones_share_state() {
        let control = control();
        let other = control.clone();
        other.stop();
        other.set_active_flows(4);
        assert!(!control.is_enabled());
        assert_eq!(control.status(Instant::now()).active_flows, 4);
    }
}
