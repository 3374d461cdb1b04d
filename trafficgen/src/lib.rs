//! The trafficgen daemon, a synthetic HTTP access-log generator.
//!
//! This library supports the trafficgen binary found elsewhere in this
//! project. A single generation loop, see [`generator`], emits one JSON
//! record per simulated request while the control API, see [`api`], adjusts
//! its behavior at runtime. The payload shapes themselves live in the
//! `trafficgen_payload` crate.

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
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};

pub mod api;
pub mod assignment;
pub mod config;
pub mod control;
pub mod ddos;
pub mod generator;
pub mod identity;
pub mod scheduler;
pub mod signals;
pub mod sink;

#[inline]
pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
