//! Multi-step user sessions.
//!
//! A [`FlowDefinition`] is an ordered list of URL templates. Path segments of
//! the form `:name` are placeholders, materialized once per session from the
//! configured [`PlaceholderSpec`] and reused by every later step of that same
//! session. A [`FlowInstance`] walks one definition step by step on behalf of
//! one simulated user.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use rand::{Rng, seq::IndexedRandom};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::UserContext;

const UNCONFIGURED_MIN: u32 = 1_000;
const UNCONFIGURED_MAX: u32 = 9_999;
const CHOICE_FALLBACK: &str = "default";

fn default_integer_min() -> u32 {
    1
}

fn default_integer_max() -> u32 {
    9_999
}

/// How to materialize one placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum PlaceholderSpec {
    /// A uniform integer in `[min, max]`. Inverted bounds are swapped.
    Integer {
        /// Smallest value, inclusive.
        #[serde(default = "default_integer_min")]
        min: u32,
        /// Largest value, inclusive.
        #[serde(default = "default_integer_max")]
        max: u32,
    },
    /// One of `values`, uniformly. An empty set yields `"default"`.
    Choice {
        /// The candidate values.
        #[serde(default)]
        values: Vec<String>,
    },
}

impl PlaceholderSpec {
    /// Draw one value.
    pub fn sample<R>(&self, rng: &mut R) -> String
    where
        R: Rng + ?Sized,
    {
        match self {
            Self::Integer { min, max } => {
                let (low, high) = if min <= max { (*min, *max) } else { (*max, *min) };
                rng.random_range(low..=high).to_string()
            }
            Self::Choice { values } => values
                .choose(rng)
                .map_or_else(|| CHOICE_FALLBACK.to_string(), Clone::clone),
        }
    }
}

/// The configured placeholders, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placeholders {
    specs: FxHashMap<String, PlaceholderSpec>,
}

impl Placeholders {
    /// Create a new [`Placeholders`] from `name -> spec` pairs.
    pub fn new<I>(specs: I) -> Self
    where
        I: IntoIterator<Item = (String, PlaceholderSpec)>,
    {
        Self {
            specs: specs.into_iter().collect(),
        }
    }

    /// Draw a value for the placeholder `name`. Names without a spec resolve
    /// to an integer in `[1000, 9999]`.
    pub fn resolve<R>(&self, rng: &mut R, name: &str) -> String
    where
        R: Rng + ?Sized,
    {
        match self.specs.get(name) {
            Some(spec) => spec.sample(rng),
            None => rng
                .random_range(UNCONFIGURED_MIN..=UNCONFIGURED_MAX)
                .to_string(),
        }
    }

    /// Number of configured placeholders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether no placeholder is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// A named, weighted sequence of URL templates.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDefinition {
    name: String,
    steps: Vec<String>,
    weight: f64,
}

impl FlowDefinition {
    /// Create a new [`FlowDefinition`].
    ///
    /// A negative or non-finite `weight` is treated as zero.
    #[must_use]
    pub fn new(name: impl Into<String>, steps: Vec<String>, weight: f64) -> Self {
        let name = name.into();
        let weight = if weight.is_finite() && weight >= 0.0 {
            weight
        } else {
            warn!(flow = %name, weight, "flow weight must be a finite non-negative number, using 0");
            0.0
        };
        Self {
            name,
            steps,
            weight,
        }
    }

    /// The flow's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The URL templates, in order.
    #[must_use]
    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    /// Relative selection weight.
    #[must_use]
    pub fn weight(&self) -> f64 {
        self.weight
    }
}

/// Where a [`FlowInstance`] is in its definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No step emitted yet.
    Pending,
    /// Some but not all steps emitted.
    InProgress,
    /// Every step emitted. Terminal.
    Complete,
}

/// One simulated user walking a [`FlowDefinition`].
#[derive(Debug)]
pub struct FlowInstance {
    definition: Arc<FlowDefinition>,
    cursor: usize,
    resolved: FxHashMap<String, String>,
    session_id: Uuid,
    context: UserContext,
    started: Instant,
}

impl FlowInstance {
    /// Create a new [`FlowInstance`] at the first step of `definition`.
    #[must_use]
    pub fn new(
        definition: Arc<FlowDefinition>,
        session_id: Uuid,
        context: UserContext,
        started: Instant,
    ) -> Self {
        Self {
            definition,
            cursor: 0,
            resolved: FxHashMap::default(),
            session_id,
            context,
            started,
        }
    }

    /// Emit the URL of the current step and move past it. Returns `None`, and
    /// changes nothing, once the instance is complete.
    pub fn advance<R>(&mut self, rng: &mut R, placeholders: &Placeholders) -> Option<String>
    where
        R: Rng + ?Sized,
    {
        let definition = Arc::clone(&self.definition);
        let template = definition.steps.get(self.cursor)?;
        let url = self.materialize(rng, placeholders, template);
        self.cursor += 1;
        Some(url)
    }

    fn materialize<R>(&mut self, rng: &mut R, placeholders: &Placeholders, template: &str) -> String
    where
        R: Rng + ?Sized,
    {
        if !template.contains(':') {
            return template.to_string();
        }
        let mut url = String::with_capacity(template.len() + 8);
        for (idx, segment) in template.split('/').enumerate() {
            if idx > 0 {
                url.push('/');
            }
            match segment.strip_prefix(':') {
                Some(name) => {
                    let value = self
                        .resolved
                        .entry(name.to_string())
                        .or_insert_with(|| placeholders.resolve(rng, name));
                    url.push_str(value);
                }
                None => url.push_str(segment),
            }
        }
        url
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        let len = self.definition.steps.len();
        if self.cursor >= len {
            State::Complete
        } else if self.cursor == 0 {
            State::Pending
        } else {
            State::InProgress
        }
    }

    /// Whether every step has been emitted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state() == State::Complete
    }

    /// Fraction of steps emitted, `1.0` for a flow without steps.
    #[must_use]
    pub fn progress(&self) -> f64 {
        let len = self.definition.steps.len();
        if len == 0 {
            1.0
        } else {
            self.cursor as f64 / len as f64
        }
    }

    /// Time elapsed between creation and `now`.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// The session this instance represents.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Identity shared by every request of the session.
    #[must_use]
    pub fn context(&self) -> &UserContext {
        &self.context
    }

    /// The definition being walked.
    #[must_use]
    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }
}
