//! Contextual HTTP status codes.
//!
//! The [`ErrorModel`] decides what the simulated server answered to a
//! request: the status code, a human readable message and the size of the
//! response body. Three tiers of weighted distributions are consulted, most
//! specific first:
//!
//! 1. DDoS traffic always samples the DDoS distribution.
//! 2. URLs matching a configured pattern sample that pattern's distribution.
//!    When several patterns match the longest wins; equal lengths go to the
//!    lexicographically smaller pattern.
//! 3. Everything else first rolls success against a base error probability,
//!    doubled for anonymous callers, then samples the keyed distribution.

use std::collections::BTreeMap;

use rand::{
    Rng,
    distr::{Distribution, weighted::WeightedIndex},
    seq::IndexedRandom,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::RequestContext;

const BASE_ERROR_RATE: f64 = 0.15;
const ANONYMOUS_ERROR_MULTIPLIER: f64 = 2.0;
const ANONYMOUS_UNAUTHORIZED_MULTIPLIER: u32 = 3;

const DDOS: &[(u16, u32)] = &[
    (200, 15),
    (400, 10),
    (401, 5),
    (403, 15),
    (404, 30),
    (429, 20),
    (500, 3),
    (503, 2),
];

const SUCCESS: &[(u16, u32)] = &[(200, 85), (201, 10), (204, 5)];

const AUTHENTICATED: &[(u16, u32)] = &[
    (200, 70),
    (201, 10),
    (204, 3),
    (301, 2),
    (400, 3),
    (401, 1),
    (403, 2),
    (404, 4),
    (429, 1),
    (500, 3),
    (503, 1),
];

const ANONYMOUS: &[(u16, u32)] = &[
    (200, 60),
    (201, 5),
    (301, 3),
    (400, 8),
    (401, 10),
    (403, 5),
    (404, 6),
    (429, 1),
    (500, 1),
    (503, 1),
];

const URL_PATTERNS: &[(&str, &[(u16, u32)])] = &[
    (
        "/login",
        &[(200, 70), (400, 15), (401, 10), (429, 3), (500, 2)],
    ),
    (
        "/checkout",
        &[(200, 65), (400, 15), (402, 8), (500, 7), (503, 5)],
    ),
    (
        "/add_to_cart",
        &[(200, 80), (400, 8), (404, 5), (409, 5), (500, 2)],
    ),
    (
        "/cart",
        &[(200, 85), (400, 5), (404, 5), (410, 3), (500, 2)],
    ),
    ("/products", &[(200, 85), (404, 10), (500, 3), (503, 2)]),
    (
        "/profile",
        &[(200, 80), (401, 10), (403, 5), (404, 3), (500, 2)],
    ),
    (
        "/order",
        &[(200, 75), (400, 10), (404, 8), (403, 5), (500, 2)],
    ),
];

fn default_url_patterns() -> BTreeMap<String, BTreeMap<u16, u32>> {
    URL_PATTERNS
        .iter()
        .map(|(pattern, weights)| ((*pattern).to_string(), weights.iter().copied().collect()))
        .collect()
}

/// Configuration for [`ErrorModel`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Per URL substring status distributions, pattern to status to weight.
    #[serde(default = "default_url_patterns")]
    pub url_patterns: BTreeMap<String, BTreeMap<u16, u32>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url_patterns: default_url_patterns(),
        }
    }
}

/// The server's simulated answer to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// HTTP status code.
    pub status: u16,
    /// Human readable description of `status`.
    pub message: String,
    /// Size of the response body in bytes.
    pub bytes: u32,
}

/// A weighted status distribution.
#[derive(Debug, Clone)]
struct Table {
    codes: Vec<u16>,
    index: WeightedIndex<u32>,
}

impl Table {
    fn new(entries: &[(u16, u32)]) -> Result<Self, rand::distr::weighted::Error> {
        let index = WeightedIndex::new(entries.iter().map(|(_, weight)| *weight))?;
        Ok(Self {
            codes: entries.iter().map(|(code, _)| *code).collect(),
            index,
        })
    }

    fn sample<R>(&self, rng: &mut R) -> u16
    where
        R: Rng + ?Sized,
    {
        self.codes[self.index.sample(rng)]
    }
}

/// A URL pattern and its distributions for authenticated and anonymous
/// callers. The two differ only in the weight of 401.
#[derive(Debug, Clone)]
struct Pattern {
    needle: String,
    authenticated: Table,
    anonymous: Table,
}

impl Pattern {
    fn new(needle: String, weights: &BTreeMap<u16, u32>) -> Result<Self, rand::distr::weighted::Error> {
        let entries: Vec<(u16, u32)> = weights.iter().map(|(c, w)| (*c, *w)).collect();
        let boosted: Vec<(u16, u32)> = entries
            .iter()
            .map(|(code, weight)| {
                if *code == 401 {
                    (*code, weight.saturating_mul(ANONYMOUS_UNAUTHORIZED_MULTIPLIER))
                } else {
                    (*code, *weight)
                }
            })
            .collect();
        Ok(Self {
            needle,
            authenticated: Table::new(&entries)?,
            anonymous: Table::new(&boosted)?,
        })
    }
}

/// Generates realistic status codes for a request context.
#[derive(Debug, Clone)]
pub struct ErrorModel {
    ddos: Table,
    success: Table,
    authenticated: Table,
    anonymous: Table,
    /// Sorted so that the first match is the preferred one: longest needle
    /// first, ties broken lexicographically.
    patterns: Vec<Pattern>,
}

impl Default for ErrorModel {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl ErrorModel {
    /// Create a new [`ErrorModel`].
    ///
    /// Patterns whose weights cannot form a distribution -- empty, or all
    /// zero -- are skipped with a warning.
    ///
    /// # Panics
    ///
    /// None known, the built-in distributions are valid.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let mut patterns: Vec<Pattern> = config
            .url_patterns
            .iter()
            .filter_map(|(needle, weights)| match Pattern::new(needle.clone(), weights) {
                Ok(pattern) if !needle.is_empty() => Some(pattern),
                Ok(_) => {
                    warn!("ignoring empty URL pattern in error model");
                    None
                }
                Err(err) => {
                    warn!(pattern = %needle, "ignoring URL pattern with unusable weights: {err}");
                    None
                }
            })
            .collect();
        patterns.sort_by(|a, b| {
            b.needle
                .len()
                .cmp(&a.needle.len())
                .then_with(|| a.needle.cmp(&b.needle))
        });

        Self {
            ddos: Table::new(DDOS).expect("built-in DDoS table is valid"),
            success: Table::new(SUCCESS).expect("built-in success table is valid"),
            authenticated: Table::new(AUTHENTICATED).expect("built-in table is valid"),
            anonymous: Table::new(ANONYMOUS).expect("built-in table is valid"),
            patterns,
        }
    }

    /// The URL pattern that governs `url`, if any.
    #[must_use]
    pub fn pattern_for(&self, url: &str) -> Option<&str> {
        self.matching(url).map(|pattern| pattern.needle.as_str())
    }

    fn matching(&self, url: &str) -> Option<&Pattern> {
        self.patterns.iter().find(|pattern| url.contains(&pattern.needle))
    }

    /// Decide the outcome of the request described by `ctx`.
    pub fn classify<R>(&self, rng: &mut R, ctx: &RequestContext) -> Outcome
    where
        R: Rng + ?Sized,
    {
        let status = self.status(rng, &ctx.url, ctx.authenticated(), ctx.ddos);
        Outcome {
            status,
            message: message(rng, status, &ctx.url),
            bytes: response_bytes(rng, status),
        }
    }

    fn status<R>(&self, rng: &mut R, url: &str, authenticated: bool, ddos: bool) -> u16
    where
        R: Rng + ?Sized,
    {
        if ddos {
            return self.ddos.sample(rng);
        }

        if let Some(pattern) = self.matching(url) {
            return if authenticated {
                pattern.authenticated.sample(rng)
            } else {
                pattern.anonymous.sample(rng)
            };
        }

        let error_rate = if authenticated {
            BASE_ERROR_RATE
        } else {
            BASE_ERROR_RATE * ANONYMOUS_ERROR_MULTIPLIER
        };
        if rng.random::<f64>() > error_rate {
            self.success.sample(rng)
        } else if authenticated {
            self.authenticated.sample(rng)
        } else {
            self.anonymous.sample(rng)
        }
    }
}

/// Statuses the DDoS distribution can produce.
#[must_use]
pub fn ddos_statuses() -> impl Iterator<Item = u16> {
    DDOS.iter().map(|(code, _)| *code)
}

fn message<R>(rng: &mut R, status: u16, url: &str) -> String
where
    R: Rng + ?Sized,
{
    let fixed = match status {
        200 => "Success",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        400 => return bad_request_message(rng, url).to_string(),
        401 => "Unauthorized - Authentication required",
        402 => "Payment Required - Card declined",
        403 => "Forbidden - Access denied",
        404 => "Not Found",
        409 => "Conflict - Item out of stock",
        410 => "Gone - Resource expired",
        429 => "Too Many Requests - Rate limit exceeded",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        other => return format!("HTTP {other}"),
    };
    fixed.to_string()
}

fn bad_request_message<R>(rng: &mut R, url: &str) -> &'static str
where
    R: Rng + ?Sized,
{
    let choices: &[&'static str] = if url.contains("/login") {
        &[
            "Bad Request - Invalid credentials",
            "Bad Request - Missing password",
            "Bad Request - Invalid email format",
        ]
    } else if url.contains("/checkout") {
        &[
            "Bad Request - Invalid payment information",
            "Bad Request - Missing billing address",
            "Bad Request - Invalid card number",
        ]
    } else if url.contains("/add_to_cart") {
        &[
            "Bad Request - Invalid product ID",
            "Bad Request - Invalid quantity",
            "Bad Request - Product unavailable",
        ]
    } else if url.contains("/profile") || url.contains("/user") {
        &[
            "Bad Request - Invalid user data",
            "Bad Request - Missing required fields",
        ]
    } else {
        &["Bad Request - Invalid parameters"]
    };
    choices
        .choose(rng)
        .copied()
        .unwrap_or("Bad Request - Invalid parameters")
}

/// Draw a response body size appropriate to `status`.
pub fn response_bytes<R>(rng: &mut R, status: u16) -> u32
where
    R: Rng + ?Sized,
{
    match status {
        0..300 => rng.random_range(1_000..=50_000),
        300..400 => rng.random_range(100..=500),
        400..500 => rng.random_range(200..=2_000),
        _ => rng.random_range(150..=1_500),
    }
}
