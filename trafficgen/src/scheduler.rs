//! The flow scheduler.
//!
//! The scheduler owns every in-progress [`FlowInstance`] and decides, once
//! per tick, what kind of request the generator emits next: an anonymous
//! request, the next step of an active flow, or the first step of a new flow.
//! Starting a flow needs an identity from a collaborator, so that decision is
//! handed back to the caller as [`Decision::Start`] and completed with
//! [`Scheduler::begin`].
//!
//! The scheduler never reads the clock; every operation that cares about
//! time takes `now`.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use rand::{
    Rng,
    distr::{Distribution, weighted::WeightedIndex},
    seq::IndexedRandom,
};
use tracing::{debug, warn};
use trafficgen_payload::{
    FlowDefinition, FlowInstance, Method, MethodMap, Placeholders, UserContext,
};
use uuid::Uuid;

use crate::config;

/// What the generator should emit this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// A request that belongs to no flow.
    Anonymous,
    /// The next step of an active flow.
    Step(Step),
    /// Start a new flow of this definition.
    Start(Arc<FlowDefinition>),
}

/// One concrete flow request.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Resolved URL.
    pub url: String,
    /// Method from the method mapping.
    pub method: Method,
    /// Session of the flow.
    pub session_id: Uuid,
    /// Name of the flow.
    pub flow_name: String,
    /// Identity shared by the flow's requests.
    pub context: UserContext,
}

/// Mint a version 4 UUID from `rng`.
pub fn session_id<R>(rng: &mut R) -> Uuid
where
    R: Rng + ?Sized,
{
    uuid::Builder::from_random_bytes(rng.random()).into_uuid()
}

/// Draw uniformly from `[min, max]` seconds. Draws beyond what a [`Duration`]
/// holds saturate to [`Duration::MAX`].
pub fn uniform_delay<R>(rng: &mut R, min: f64, max: f64) -> Duration
where
    R: Rng + ?Sized,
{
    let ceiling = Duration::MAX.as_secs_f64();
    let (low, high) = if min <= max { (min, max) } else { (max, min) };
    let (low, high) = (low.clamp(0.0, ceiling), high.clamp(0.0, ceiling));
    let secs = if high > low {
        rng.random_range(low..=high)
    } else {
        low
    };
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

/// Owns the active flow set.
#[derive(Debug)]
pub struct Scheduler {
    config: config::Scheduler,
    definitions: Vec<Arc<FlowDefinition>>,
    weights: Option<WeightedIndex<f64>>,
    placeholders: Placeholders,
    methods: MethodMap,
    active: Vec<FlowInstance>,
    last_cleanup: Instant,
}

impl Scheduler {
    /// Create a new [`Scheduler`] with no active flows.
    ///
    /// When every definition weighs zero, definitions are picked uniformly.
    #[must_use]
    pub fn new(
        config: config::Scheduler,
        definitions: Vec<Arc<FlowDefinition>>,
        placeholders: Placeholders,
        methods: MethodMap,
        now: Instant,
    ) -> Self {
        let weights = if definitions.is_empty() {
            None
        } else {
            match WeightedIndex::new(definitions.iter().map(|d| d.weight())) {
                Ok(index) => Some(index),
                Err(err) => {
                    warn!("flow weights unusable ({err}), selecting flows uniformly");
                    None
                }
            }
        };
        Self {
            config,
            definitions,
            weights,
            placeholders,
            methods,
            active: Vec::new(),
            last_cleanup: now,
        }
    }

    /// Number of in-progress flows.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Decide what this tick emits.
    pub fn decide<R>(&mut self, rng: &mut R, now: Instant) -> Decision
    where
        R: Rng + ?Sized,
    {
        self.maintain(now);

        let random_roll = rng.random::<f64>() * 100.0;
        if random_roll < self.config.random_request_percentage {
            return Decision::Anonymous;
        }

        if !self.active.is_empty() {
            let idx = rng.random_range(0..self.active.len());
            if let Some(step) = self.touch(rng, idx) {
                return Decision::Step(step);
            }
        }

        match self.pick_definition(rng) {
            Some(definition) => Decision::Start(definition),
            None => Decision::Anonymous,
        }
    }

    /// Register a new flow of `definition` for `context` and attempt its
    /// first step. `None` means the flow was abandoned on the spot, or had no
    /// steps, and the tick should fall back to an anonymous request.
    pub fn begin<R>(
        &mut self,
        rng: &mut R,
        definition: Arc<FlowDefinition>,
        session_id: Uuid,
        context: UserContext,
        now: Instant,
    ) -> Option<Step>
    where
        R: Rng + ?Sized,
    {
        debug!(flow = definition.name(), %session_id, "starting flow");
        self.active
            .push(FlowInstance::new(definition, session_id, context, now));
        let idx = self.active.len() - 1;
        self.touch(rng, idx)
    }

    /// Abandon, advance or retire the instance at `idx`.
    fn touch<R>(&mut self, rng: &mut R, idx: usize) -> Option<Step>
    where
        R: Rng + ?Sized,
    {
        if rng.random::<f64>() < self.config.flow_abandon_probability {
            let flow = self.active.swap_remove(idx);
            debug!(flow = flow.definition().name(), session_id = %flow.session_id(), "flow abandoned");
            return None;
        }

        let flow = &mut self.active[idx];
        let url = flow.advance(rng, &self.placeholders);
        let step = url.map(|url| Step {
            method: self.methods.method_for(&url),
            url,
            session_id: flow.session_id(),
            flow_name: flow.definition().name().to_string(),
            context: flow.context().clone(),
        });
        if flow.is_complete() {
            let flow = self.active.swap_remove(idx);
            debug!(flow = flow.definition().name(), session_id = %flow.session_id(), "flow complete");
        }
        step
    }

    fn pick_definition<R>(&self, rng: &mut R) -> Option<Arc<FlowDefinition>>
    where
        R: Rng + ?Sized,
    {
        let definition = match &self.weights {
            Some(index) => self.definitions.get(index.sample(rng)),
            None => self.definitions.choose(rng),
        };
        definition.map(Arc::clone)
    }

    /// Expire stale flows if a cleanup interval has passed since the last
    /// sweep.
    pub fn maintain(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_cleanup) >= self.config.cleanup_interval() {
            self.expire(now);
            self.last_cleanup = now;
        }
    }

    /// Drop every flow older than the staleness window, whatever its state.
    pub fn expire(&mut self, now: Instant) {
        let max_age = self.config.flow_max_age();
        let before = self.active.len();
        self.active.retain(|flow| flow.age(now) < max_age);
        let dropped = before - self.active.len();
        if dropped > 0 {
            debug!("expired {dropped} stale flows");
        }
    }

    /// Sleep after a flow step.
    pub fn step_delay<R>(&self, rng: &mut R) -> Duration
    where
        R: Rng + ?Sized,
    {
        uniform_delay(
            rng,
            self.config.flow_step_delay_min,
            self.config.flow_step_delay_max,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};
    use rustc_hash::FxHashMap;

    use super::*;

    fn context() -> UserContext {
        UserContext {
            client_ip: Ipv4Addr::new(12, 0, 0, 1),
            user_agent: "agent".to_string(),
            user_id: Some(3),
            user_name: "kim".to_string(),
            geocode: None,
        }
    }

    fn checkout() -> Arc<FlowDefinition> {
        Arc::new(FlowDefinition::new(
            "checkout",
            vec![
                "/cart".to_string(),
                "/checkout/:order_id".to_string(),
                "/order/:order_id/confirm".to_string(),
            ],
            1.0,
        ))
    }

    fn scheduler(config: config::Scheduler, definitions: Vec<Arc<FlowDefinition>>) -> Scheduler {
        Scheduler::new(
            config,
            definitions,
            Placeholders::default(),
            MethodMap::new([("/checkout".to_string(), Method::Post)]),
            Instant::now(),
        )
    }

    fn deterministic() -> config::Scheduler {
        config::Scheduler {
            random_request_percentage: 0.0,
            flow_abandon_probability: 0.0,
            ..config::Scheduler::default()
        }
    }

    #[test]
    fn all_random_traffic_never_touches_flows() {
        let config = config::Scheduler {
            random_request_percentage: 100.0,
            ..config::Scheduler::default()
        };
        let mut scheduler = scheduler(config, vec![checkout()]);
        let mut rng = SmallRng::seed_from_u64(1);
        let now = Instant::now();
        for _ in 0..1_000 {
            assert_eq!(scheduler.decide(&mut rng, now), Decision::Anonymous);
        }
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn no_definitions_means_anonymous() {
        let mut scheduler = scheduler(deterministic(), Vec::new());
        let mut rng = SmallRng::seed_from_u64(1);
        assert_eq!(scheduler.decide(&mut rng, Instant::now()), Decision::Anonymous);
    }

    #[test]
    fn checkout_flow_runs_to_completion() {
        let mut scheduler = scheduler(deterministic(), vec![checkout()]);
        let mut rng = SmallRng::seed_from_u64(2);
        let now = Instant::now();

        let Decision::Start(definition) = scheduler.decide(&mut rng, now) else {
            panic!("empty scheduler must start a flow");
        };
        let session = session_id(&mut rng);
        let first = scheduler
            .begin(&mut rng, definition, session, context(), now)
            .expect("first step");
        assert_eq!(first.url, "/cart");
        assert_eq!(first.method, Method::Get);
        assert_eq!(scheduler.active_count(), 1);

        let Decision::Step(second) = scheduler.decide(&mut rng, now) else {
            panic!("active flow must advance");
        };
        let Decision::Step(third) = scheduler.decide(&mut rng, now) else {
            panic!("active flow must advance");
        };
        assert_eq!(second.method, Method::Post);
        let id = second.url.trim_start_matches("/checkout/");
        assert_eq!(third.url, format!("/order/{id}/confirm"));
        for step in [&first, &second, &third] {
            assert_eq!(step.session_id, session);
            assert_eq!(step.flow_name, "checkout");
            assert_eq!(step.context, context());
        }
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn certain_abandonment_falls_back() {
        let config = config::Scheduler {
            random_request_percentage: 0.0,
            flow_abandon_probability: 1.0,
            ..config::Scheduler::default()
        };
        let mut scheduler = scheduler(config, vec![checkout()]);
        let mut rng = SmallRng::seed_from_u64(4);
        let now = Instant::now();
        let step = scheduler.begin(&mut rng, checkout(), Uuid::nil(), context(), now);
        assert!(step.is_none());
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn stale_flows_expire_during_maintenance() {
        let config = config::Scheduler {
            random_request_percentage: 100.0,
            ..deterministic()
        };
        let start = Instant::now();
        let mut scheduler = Scheduler::new(
            config,
            vec![checkout()],
            Placeholders::default(),
            MethodMap::default(),
            start,
        );
        let mut rng = SmallRng::seed_from_u64(5);
        scheduler.begin(&mut rng, checkout(), Uuid::nil(), context(), start);
        assert_eq!(scheduler.active_count(), 1);

        // Maintenance only runs once per cleanup interval.
        scheduler.decide(&mut rng, start + Duration::from_secs(30));
        assert_eq!(scheduler.active_count(), 1);
        scheduler.decide(&mut rng, start + Duration::from_secs(299));
        assert_eq!(scheduler.active_count(), 1);
        scheduler.decide(&mut rng, start + Duration::from_secs(400));
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn maintenance_runs_without_a_decision() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new(
            deterministic(),
            vec![checkout()],
            Placeholders::default(),
            MethodMap::default(),
            start,
        );
        let mut rng = SmallRng::seed_from_u64(8);
        scheduler.begin(&mut rng, checkout(), Uuid::nil(), context(), start);

        scheduler.maintain(start + Duration::from_secs(59));
        assert_eq!(scheduler.active_count(), 1);
        scheduler.maintain(start + Duration::from_secs(301));
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn oversized_delays_saturate() {
        let mut rng = SmallRng::seed_from_u64(9);
        assert_eq!(uniform_delay(&mut rng, 1e300, 1e300), Duration::MAX);
        assert_eq!(uniform_delay(&mut rng, f64::MAX, 1e300), Duration::MAX);
        // Nearly every draw from this range overflows a Duration.
        let wide = uniform_delay(&mut rng, 0.0, f64::MAX);
        assert!(wide > Duration::from_secs(3_600));
        assert_eq!(uniform_delay(&mut rng, 0.0, 0.0), Duration::ZERO);
    }

    #[test]
    fn zero_weights_select_uniformly() {
        let a = Arc::new(FlowDefinition::new("a", vec!["/a".to_string()], 0.0));
        let b = Arc::new(FlowDefinition::new("b", vec!["/b".to_string()], 0.0));
        let scheduler = scheduler(deterministic(), vec![a, b]);
        let mut rng = SmallRng::seed_from_u64(6);
        let mut seen: FxHashMap<String, usize> = FxHashMap::default();
        for _ in 0..1_000 {
            let definition = scheduler.pick_definition(&mut rng).expect("definitions exist");
            *seen.entry(definition.name().to_string()).or_default() += 1;
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn weights_bias_selection() {
        let heavy = Arc::new(FlowDefinition::new("heavy", vec!["/h".to_string()], 9.0));
        let light = Arc::new(FlowDefinition::new("light", vec!["/l".to_string()], 1.0));
        let never = Arc::new(FlowDefinition::new("never", vec!["/n".to_string()], 0.0));
        let scheduler = scheduler(deterministic(), vec![heavy, light, never]);
        let mut rng = SmallRng::seed_from_u64(7);
        let mut seen: FxHashMap<String, usize> = FxHashMap::default();
        for _ in 0..2_000 {
            let definition = scheduler.pick_definition(&mut rng).expect("definitions exist");
            *seen.entry(definition.name().to_string()).or_default() += 1;
        }
        assert!(seen["heavy"] > seen["light"] * 4);
        assert!(!seen.contains_key("never"));
    }

    proptest! {
        #[test]
        fn delays_stay_in_bounds(seed: u64, min in 0.0_f64..10.0, width in 0.0_f64..10.0) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let delay = uniform_delay(&mut rng, min, min + width).as_secs_f64();
            prop_assert!(delay >= min - 1e-9);
            prop_assert!(delay <= min + width + 1e-9);
        }

        #[test]
        fn active_set_only_holds_incomplete_flows(seed: u64, ticks in 1_usize..200) {
            let config = config::Scheduler {
                random_request_percentage: 20.0,
                flow_abandon_probability: 0.1,
                ..config::Scheduler::default()
            };
            let mut scheduler = scheduler(config, vec![checkout()]);
            let mut rng = SmallRng::seed_from_u64(seed);
            let now = Instant::now();
            for _ in 0..ticks {
                if let Decision::Start(definition) = scheduler.decide(&mut rng, now) {
                    let session = session_id(&mut rng);
                    scheduler.begin(&mut rng, definition, session, context(), now);
                }
                prop_assert!(scheduler.active.iter().all(|flow| !flow.is_complete()));
            }
        }
    }
}
