//! The generation loop.
//!
//! One task emits every record. Each tick takes a [`Snapshot`] of the runtime
//! settings and then does exactly one of the following: nothing while
//! generation is disabled, a DDoS burst, a single anonymous request, or a
//! single flow step. It then sleeps for the delay the tick chose. Records are
//! written to the sink synchronously, before the sleep, so output order is
//! generation order.
//!
//! ## Metrics
//!
//! `logs_generated_total`: Records emitted
//! `http_requests_total`: Records emitted, by `method` and `status_code`
//! `http_requests_by_location_total`: Records emitted, by `country` and `city`
//! `active_flows_total`: In-progress flows after each tick, disabled and
//! burst ticks included
//!

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::counter;
use rand::{Rng, SeedableRng, rngs::StdRng};
use time::OffsetDateTime;
use tracing::{debug, error, info};
use trafficgen_payload::{
    AnonymousUrl, ErrorModel, Generator as _, LogRecord, Method, Referrer, RequestContext,
    UserContext, request::user_agent,
};

use crate::{
    assignment,
    config::Config,
    control::{Control, Snapshot},
    ddos::{self, Phase, Target},
    identity::{self, Directory, Identity, Offline, UserDatabase},
    scheduler::{self, Decision, Scheduler, Step},
    signals::Watcher,
    sink::Sink,
};

/// Sleep of a tick while generation is disabled.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Errors produced by [`Generator`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`identity::Error`].
    #[error("Identity client could not be built: {0}")]
    Identity(#[from] identity::Error),
    /// Wrapper for [`assignment::Error`].
    #[error("Assignment client could not be built: {0}")]
    Assignment(#[from] assignment::Error),
}

#[derive(Debug, Clone, Copy)]
struct Readiness {
    attempts: u32,
    delay: Duration,
}

/// The traffic generator.
pub struct Generator<S> {
    engine: Engine<S>,
    readiness: Option<Readiness>,
    shutdown: Watcher,
}

impl<S> std::fmt::Debug for Generator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("control", &self.engine.control)
            .field("readiness", &self.readiness)
            .finish_non_exhaustive()
    }
}

impl<S> Generator<S>
where
    S: Sink,
{
    /// Create a new [`Generator`] writing to `sink`.
    ///
    /// # Errors
    ///
    /// Function will error if a collaborator client cannot be built.
    pub fn new(config: &Config, control: Control, sink: S, shutdown: Watcher) -> Result<Self, Error> {
        let (directory, readiness): (Arc<dyn Directory>, _) = match &config.identity {
            Some(identity) => (
                Arc::new(UserDatabase::new(identity)?),
                Some(Readiness {
                    attempts: identity.health_attempts,
                    delay: Duration::from_secs(identity.health_delay_seconds),
                }),
            ),
            None => {
                info!("no identity service configured, users are made up locally");
                (Arc::new(Offline), None)
            }
        };
        let assignment = config
            .assignment
            .as_ref()
            .map(assignment::Client::new)
            .transpose()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let scheduler = Scheduler::new(
            config.scheduler,
            config.flow_definitions(),
            config.placeholders(),
            config.method_map(),
            Instant::now(),
        );

        Ok(Self {
            engine: Engine {
                control,
                scheduler,
                error_model: ErrorModel::new(&config.error_model),
                directory,
                assignment,
                sink,
                rng,
            },
            readiness,
            shutdown,
        })
    }

    /// Run [`Generator`] until a shutdown signal is received.
    ///
    /// When an identity service is configured the loop first waits for it to
    /// report healthy, giving up after the configured number of attempts.
    pub async fn spin(self) {
        let Self {
            mut engine,
            readiness,
            mut shutdown,
        } = self;

        if let Some(readiness) = readiness {
            identity::wait_ready(
                engine.directory.as_ref(),
                readiness.attempts,
                readiness.delay,
                &mut shutdown,
            )
            .await;
        }

        info!("traffic generation loop running");
        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            let delay = tokio::select! {
                delay = engine.tick(Instant::now()) => delay,
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return;
                }
            };
            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return;
                }
            }
        }
    }
}

/// Everything one tick touches.
struct Engine<S> {
    control: Control,
    scheduler: Scheduler,
    error_model: ErrorModel,
    directory: Arc<dyn Directory>,
    assignment: Option<assignment::Client>,
    sink: S,
    rng: StdRng,
}

impl<S> Engine<S>
where
    S: Sink,
{
    /// Run one tick, returning how long to sleep before the next. Stale
    /// flows are swept on every tick, whatever it emits.
    async fn tick(&mut self, now: Instant) -> Duration {
        self.scheduler.maintain(now);
        let delay = self.produce(now).await;
        self.control.set_active_flows(self.scheduler.active_count());
        delay
    }

    async fn produce(&mut self, now: Instant) -> Duration {
        let Snapshot {
            enabled,
            min_interval,
            max_interval,
            ddos,
        } = self.control.snapshot(now);
        if !enabled {
            return IDLE_POLL;
        }

        match ddos {
            Phase::Burst(target) => {
                self.burst(&target);
                return ddos::BURST_PAUSE;
            }
            Phase::Ended => return Duration::ZERO,
            Phase::Idle => {}
        }

        match self.scheduler.decide(&mut self.rng, now) {
            Decision::Anonymous => {
                self.anonymous().await;
                scheduler::uniform_delay(&mut self.rng, min_interval, max_interval)
            }
            Decision::Step(step) => {
                self.step(step);
                self.scheduler.step_delay(&mut self.rng)
            }
            Decision::Start(definition) => {
                let context = self.user_context().await;
                let session_id = scheduler::session_id(&mut self.rng);
                if let Some(client) = &self.assignment {
                    client.announce(assignment::Request {
                        session_id,
                        client_ip: context.client_ip,
                        user_id: context.user_id,
                    });
                }
                match self
                    .scheduler
                    .begin(&mut self.rng, definition, session_id, context, now)
                {
                    Some(step) => {
                        self.step(step);
                        self.scheduler.step_delay(&mut self.rng)
                    }
                    None => {
                        self.anonymous().await;
                        scheduler::uniform_delay(&mut self.rng, min_interval, max_interval)
                    }
                }
            }
        }
    }

    /// A user with an identity, a located address and a browser.
    async fn user_context(&mut self) -> UserContext {
        let Identity { id, name } = identity::lookup(self.directory.as_ref(), &mut self.rng).await;
        let (client_ip, geocode) = self.control.regions().pick(&mut self.rng, None);
        UserContext {
            client_ip,
            user_agent: user_agent(&mut self.rng).to_string(),
            user_id: id,
            user_name: name,
            geocode: Some(geocode),
        }
    }

    async fn anonymous(&mut self) {
        let user = self.user_context().await;
        let url = AnonymousUrl {
            user_id: user.user_id,
        }
        .generate(&mut self.rng);
        let method: Method = self.rng.random();
        let session_id = scheduler::session_id(&mut self.rng);
        self.emit(RequestContext::for_user(&user, url, method, session_id));
    }

    fn step(&mut self, step: Step) {
        let Step {
            url,
            method,
            session_id,
            flow_name,
            context,
        } = step;
        let mut ctx = RequestContext::for_user(&context, url, method, session_id);
        ctx.flow_name = Some(flow_name);
        self.emit(ctx);
    }

    /// Emit one burst from `target`. Burst requests never consult the
    /// identity service.
    fn burst(&mut self, target: &Target) {
        let size = ddos::burst_size(&mut self.rng);
        debug!(region = %target.region, "emitting DDoS burst of {size}");
        for _ in 0..size {
            let Identity { id, name } = Identity::fallback(&mut self.rng);
            let ctx = RequestContext {
                url: AnonymousUrl { user_id: id }.generate(&mut self.rng),
                method: self.rng.random(),
                client_ip: target.client_ip,
                geocode: Some(target.geocode.clone()),
                user_id: id,
                user_name: name,
                user_agent: user_agent(&mut self.rng).to_string(),
                session_id: scheduler::session_id(&mut self.rng),
                flow_name: None,
                ddos: true,
            };
            self.emit(ctx);
        }
    }

    /// Decide the outcome of `ctx` and write the resulting record.
    fn emit(&mut self, ctx: RequestContext) {
        let outcome = self.error_model.classify(&mut self.rng, &ctx);
        let referrer = Referrer.generate(&mut self.rng);
        let record = match LogRecord::new(ctx, outcome, referrer, OffsetDateTime::now_utc()) {
            Ok(record) => record,
            Err(err) => {
                error!("dropping record: {err}");
                return;
            }
        };
        if let Err(err) = self.sink.write(&record) {
            error!("dropping record: {err}");
            return;
        }

        counter!("logs_generated_total").increment(1);
        counter!(
            "http_requests_total",
            "method" => record.method().as_str(),
            "status_code" => record.status().to_string()
        )
        .increment(1);
        if let Some(geocode) = record.geocode() {
            counter!(
                "http_requests_by_location_total",
                "country" => geocode.country_name.clone(),
                "city" => geocode.city_name.clone()
            )
            .increment(1);
        }
    }
}
