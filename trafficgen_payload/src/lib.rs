//! The trafficgen payloads
//!
//! This library holds the pure generators behind trafficgen: where a request
//! comes from, which URL a simulated session visits next, what the server
//! "answered" and how the resulting access-log record looks. Nothing in here
//! performs IO or reads the clock on its own behalf; every random choice is
//! made against a caller-supplied [`rand::Rng`] so that callers may seed runs
//! for reproducibility.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

pub use error_model::{ErrorModel, Outcome};
pub use flow::{FlowDefinition, FlowInstance, PlaceholderSpec, Placeholders};
pub use geo::{Geocode, RegionTable};
pub use record::{Level, LogRecord, RequestContext, UserContext};
pub use request::{AnonymousUrl, Method, MethodMap, Referrer};

pub mod error_model;
pub mod flow;
pub mod geo;
pub mod record;
pub mod request;

/// Errors produced while building payloads.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Record could not be encoded as JSON.
    #[error("Json payload could not be encoded: {0}")]
    Json(#[from] serde_json::Error),
    /// Record timestamp could not be formatted.
    #[error("Timestamp could not be formatted: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// Generate instance of `T` from source of randomness
pub trait Generator<T> {
    /// Generate a new instance of `T`.
    fn generate<R>(&self, rng: &mut R) -> T
    where
        R: rand::Rng + ?Sized;
}
