//! DDoS burst simulation.
//!
//! While an attack is active every tick emits a burst of requests from one
//! client address in one region. The address and its geocode are drawn once,
//! when the attack is activated, and shared by every burst until the
//! deadline passes. The first poll at or after the deadline reports
//! [`Phase::Ended`] exactly once and clears the attack.

use std::{
    net::Ipv4Addr,
    ops::RangeInclusive,
    time::{Duration, Instant},
};

use rand::Rng;
use serde::Serialize;
use tracing::info;
use trafficgen_payload::{Geocode, RegionTable};

/// Requests emitted per burst.
pub const BURST_SIZE: RangeInclusive<usize> = 50..=100;

/// Pause after each burst.
pub const BURST_PAUSE: Duration = Duration::from_millis(100);

/// Where an attack comes from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    /// Region name, after resolving unknown names.
    pub region: String,
    /// Address shared by every attack request.
    pub client_ip: Ipv4Addr,
    /// Location of `client_ip`.
    pub geocode: Geocode,
}

#[derive(Debug, Clone, PartialEq)]
struct Attack {
    target: Target,
    deadline: Instant,
}

/// What the controller wants from the current tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// No attack. Generate normal traffic.
    Idle,
    /// Emit a burst from this target.
    Burst(Target),
    /// The attack just ended. Emit nothing this tick.
    Ended,
}

/// The DDoS mode switch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Controller {
    attack: Option<Attack>,
}

impl Controller {
    /// Start an attack lasting `duration` from `region`, replacing any
    /// running attack. Absent or unknown regions resolve to a uniformly
    /// chosen one.
    ///
    /// Returns `None`, leaving any running attack in place, when the deadline
    /// is not representable.
    pub fn activate<R>(
        &mut self,
        rng: &mut R,
        regions: &RegionTable,
        duration: Duration,
        region: Option<&str>,
        now: Instant,
    ) -> Option<&Target>
    where
        R: Rng + ?Sized,
    {
        let deadline = now.checked_add(duration)?;
        let chosen = regions.region(rng, region);
        let (client_ip, geocode) = chosen.pick(rng);
        let target = Target {
            region: chosen.name.clone(),
            client_ip,
            geocode,
        };
        if self.attack.is_some() {
            info!("replacing running DDoS simulation");
        }
        info!(
            region = %target.region,
            %client_ip,
            "DDoS simulation started for {}s",
            duration.as_secs_f64()
        );
        let attack = self.attack.insert(Attack { target, deadline });
        Some(&attack.target)
    }

    /// Advance the controller to `now`.
    pub fn poll(&mut self, now: Instant) -> Phase {
        let Some(attack) = &self.attack else {
            return Phase::Idle;
        };
        if now < attack.deadline {
            return Phase::Burst(attack.target.clone());
        }
        self.attack = None;
        info!("DDoS simulation ended");
        Phase::Ended
    }

    /// Whether an attack is registered. An attack past its deadline counts
    /// until the next [`Controller::poll`].
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.attack.is_some()
    }

    /// The running attack's target.
    #[must_use]
    pub fn target(&self) -> Option<&Target> {
        self.attack.as_ref().map(|attack| &attack.target)
    }

    /// Time left until the deadline, zero once it has passed.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.attack
            .as_ref()
            .map(|attack| attack.deadline.saturating_duration_since(now))
    }
}

/// Draw the size of one burst.
pub fn burst_size<R>(rng: &mut R) -> usize
where
    R: Rng + ?Sized,
{
    rng.random_range(BURST_SIZE)
}
