//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program.
//!
//! Every field has a default. A configuration that is present but carries
//! out-of-range values is repaired by [`Config::sanitize`], which warns about
//! each repair instead of failing.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::warn;
use trafficgen_payload::{
    FlowDefinition, Method, MethodMap, PlaceholderSpec, Placeholders, RegionTable, error_model,
    geo::Region,
};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
}

fn default_enabled() -> bool {
    true
}

fn default_min_interval() -> f64 {
    0.1
}

fn default_max_interval() -> f64 {
    3.0
}

fn default_random_request_percentage() -> f64 {
    30.0
}

fn default_flow_step_delay_min() -> f64 {
    0.5
}

fn default_flow_step_delay_max() -> f64 {
    3.0
}

fn default_flow_abandon_probability() -> f64 {
    0.15
}

fn default_flow_max_age_seconds() -> u64 {
    300
}

fn default_cleanup_interval_seconds() -> u64 {
    60
}

fn default_identity_timeout_seconds() -> u64 {
    5
}

fn default_health_attempts() -> u32 {
    30
}

fn default_health_delay_seconds() -> u64 {
    2
}

fn default_assignment_timeout_seconds() -> u64 {
    2
}

fn default_flow_weight() -> f64 {
    1.0
}

fn default_binding_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

/// Main configuration struct for this program
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Whether generation starts enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seed for the generation loop's random number generator. Absent means
    /// seeded from the operating system.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Lower bound of the sleep after an anonymous request, in seconds.
    #[serde(default = "default_min_interval")]
    pub min_interval: f64,
    /// Upper bound of the sleep after an anonymous request, in seconds.
    #[serde(default = "default_max_interval")]
    pub max_interval: f64,
    /// Flow scheduling parameters.
    #[serde(default)]
    pub scheduler: Scheduler,
    /// Flow definitions, by name.
    #[serde(default)]
    pub flows: BTreeMap<String, Flow>,
    /// Placeholder value specs, by placeholder name.
    #[serde(default)]
    pub placeholders: BTreeMap<String, PlaceholderSpec>,
    /// URL substring to HTTP method for flow requests.
    #[serde(default)]
    pub method_mapping: BTreeMap<String, Method>,
    /// Region table. The built-in table is used when absent or unusable.
    #[serde(default)]
    pub regions: Option<Vec<Region>>,
    /// Status code model.
    #[serde(default)]
    pub error_model: error_model::Config,
    /// User identity service. Identities are made up locally when absent.
    #[serde(default)]
    pub identity: Option<Identity>,
    /// Session assignment service. Not called when absent.
    #[serde(default)]
    pub assignment: Option<Assignment>,
    /// Control API.
    #[serde(default)]
    pub api: Api,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            seed: None,
            min_interval: default_min_interval(),
            max_interval: default_max_interval(),
            scheduler: Scheduler::default(),
            flows: BTreeMap::new(),
            placeholders: BTreeMap::new(),
            method_mapping: BTreeMap::new(),
            regions: None,
            error_model: error_model::Config::default(),
            identity: None,
            assignment: None,
            api: Api::default(),
        }
    }
}

/// Configuration for the flow scheduler.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Scheduler {
    /// Percentage, 0 through 100, of ticks that emit an anonymous request.
    #[serde(default = "default_random_request_percentage")]
    pub random_request_percentage: f64,
    /// Lower bound of the sleep after a flow step, in seconds.
    #[serde(default = "default_flow_step_delay_min")]
    pub flow_step_delay_min: f64,
    /// Upper bound of the sleep after a flow step, in seconds.
    #[serde(default = "default_flow_step_delay_max")]
    pub flow_step_delay_max: f64,
    /// Probability that a flow is abandoned when it is next touched.
    #[serde(default = "default_flow_abandon_probability")]
    pub flow_abandon_probability: f64,
    /// Age after which a flow is dropped regardless of progress, in seconds.
    #[serde(default = "default_flow_max_age_seconds")]
    pub flow_max_age_seconds: u64,
    /// How often stale flows are swept, in seconds.
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            random_request_percentage: default_random_request_percentage(),
            flow_step_delay_min: default_flow_step_delay_min(),
            flow_step_delay_max: default_flow_step_delay_max(),
            flow_abandon_probability: default_flow_abandon_probability(),
            flow_max_age_seconds: default_flow_max_age_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
        }
    }
}

impl Scheduler {
    /// Staleness window for active flows.
    #[must_use]
    pub fn flow_max_age(&self) -> Duration {
        Duration::from_secs(self.flow_max_age_seconds)
    }

    /// Period of the stale flow sweep.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

/// One flow definition.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Flow {
    /// URL templates in visiting order.
    #[serde(default)]
    pub steps: Vec<String>,
    /// Relative selection weight.
    #[serde(default = "default_flow_weight")]
    pub weight: f64,
}

/// Configuration of the user identity client.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Identity {
    /// Base URL of the service, for instance `http://user-database:8500`.
    pub url: String,
    /// Per request timeout, in seconds.
    #[serde(default = "default_identity_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Health checks made at startup before generation begins.
    #[serde(default = "default_health_attempts")]
    pub health_attempts: u32,
    /// Pause between health checks, in seconds.
    #[serde(default = "default_health_delay_seconds")]
    pub health_delay_seconds: u64,
}

/// Configuration of the session assignment client.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Assignment {
    /// Base URL of the service, for instance `http://server-assignment:8100`.
    pub url: String,
    /// Per request timeout, in seconds.
    #[serde(default = "default_assignment_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Configuration of the control API.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Api {
    /// address -- IP plus port -- to bind to
    #[serde(default = "default_binding_addr")]
    pub binding_addr: SocketAddr,
}

impl Default for Api {
    fn default() -> Self {
        Self {
            binding_addr: default_binding_addr(),
        }
    }
}

/// Parse `contents` as YAML and repair out-of-range values.
///
/// # Errors
///
/// Function will error if `contents` is not a valid configuration.
pub fn parse(contents: &str) -> Result<Config, Error> {
    let mut config: Config = serde_yaml::from_str(contents)?;
    config.sanitize();
    Ok(config)
}

/// Replace `value` by `fallback` when it is not a finite number in
/// `[low, high]`.
fn bounded(name: &str, value: &mut f64, low: f64, high: f64, fallback: f64) {
    if !value.is_finite() || *value < low || *value > high {
        warn!("{name} = {value} outside [{low}, {high}], using {fallback}");
        *value = fallback;
    }
}

/// Order a pair of bounds, swapping them if needed.
fn ordered(name: &str, min: &mut f64, max: &mut f64) {
    if min > max {
        warn!("{name}: min {min} exceeds max {max}, swapping");
        std::mem::swap(min, max);
    }
}

impl Config {
    /// Repair every value that would otherwise misbehave at runtime.
    pub fn sanitize(&mut self) {
        bounded(
            "min_interval",
            &mut self.min_interval,
            0.0,
            f64::MAX,
            default_min_interval(),
        );
        bounded(
            "max_interval",
            &mut self.max_interval,
            0.0,
            f64::MAX,
            default_max_interval(),
        );
        ordered("interval", &mut self.min_interval, &mut self.max_interval);

        let scheduler = &mut self.scheduler;
        bounded(
            "random_request_percentage",
            &mut scheduler.random_request_percentage,
            0.0,
            100.0,
            default_random_request_percentage(),
        );
        bounded(
            "flow_abandon_probability",
            &mut scheduler.flow_abandon_probability,
            0.0,
            1.0,
            default_flow_abandon_probability(),
        );
        bounded(
            "flow_step_delay_min",
            &mut scheduler.flow_step_delay_min,
            0.0,
            f64::MAX,
            default_flow_step_delay_min(),
        );
        bounded(
            "flow_step_delay_max",
            &mut scheduler.flow_step_delay_max,
            0.0,
            f64::MAX,
            default_flow_step_delay_max(),
        );
        ordered(
            "flow_step_delay",
            &mut scheduler.flow_step_delay_min,
            &mut scheduler.flow_step_delay_max,
        );
        if scheduler.cleanup_interval_seconds == 0 {
            warn!("cleanup_interval_seconds must be positive, using 1");
            scheduler.cleanup_interval_seconds = 1;
        }

        self.flows.retain(|name, flow| {
            if flow.steps.is_empty() {
                warn!(flow = %name, "flow has no steps, ignoring");
                false
            } else {
                true
            }
        });
    }

    /// The configured flows, in name order.
    #[must_use]
    pub fn flow_definitions(&self) -> Vec<Arc<FlowDefinition>> {
        self.flows
            .iter()
            .map(|(name, flow)| {
                Arc::new(FlowDefinition::new(
                    name.clone(),
                    flow.steps.clone(),
                    flow.weight,
                ))
            })
            .collect()
    }

    /// The configured placeholders.
    #[must_use]
    pub fn placeholders(&self) -> Placeholders {
        Placeholders::new(self.placeholders.clone())
    }

    /// The configured method mapping.
    #[must_use]
    pub fn method_map(&self) -> MethodMap {
        MethodMap::new(self.method_mapping.clone())
    }

    /// The configured region table, or the built-in one.
    #[must_use]
    pub fn region_table(&self) -> RegionTable {
        match &self.regions {
            Some(regions) => RegionTable::from_regions(regions.clone()),
            None => RegionTable::builtin(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = parse("{}").expect("empty mapping parses");
        assert_eq!(config, Config::default());
        assert!(config.enabled);
        assert!((config.scheduler.random_request_percentage - 30.0).abs() < f64::EPSILON);
        assert_eq!(config.scheduler.flow_max_age(), Duration::from_secs(300));
        assert_eq!(config.api.binding_addr, default_binding_addr());
    }

    #[test]
    fn config_deserializes_flows() {
        let contents = r#"
seed: 7
min_interval: 0.2
max_interval: 1.5
scheduler:
  random_request_percentage: 10
  flow_abandon_probability: 0.0
flows:
  checkout:
    steps:
      - /cart
      - /checkout/:order_id
      - /order/:order_id/confirm
    weight: 3
  browse:
    steps:
      - /products/:category
placeholders:
  order_id:
    type: integer
    min: 100000
    max: 999999
  category:
    type: choice
    values: [books, games]
method_mapping:
  /checkout: POST
  /add_to_cart: post
identity:
  url: http://user-database:8500
assignment:
  url: http://server-assignment:8100
api:
  binding_addr: "127.0.0.1:9000"
"#;
        let config = parse(contents).expect("valid config");
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.flows.len(), 2);
        assert!((config.flows["checkout"].weight - 3.0).abs() < f64::EPSILON);
        assert!((config.flows["browse"].weight - 1.0).abs() < f64::EPSILON);
        assert_eq!(
            config.placeholders["order_id"],
            PlaceholderSpec::Integer {
                min: 100_000,
                max: 999_999
            }
        );
        assert_eq!(config.method_mapping["/add_to_cart"], Method::Post);
        let identity = config.identity.as_ref().expect("identity configured");
        assert_eq!(identity.timeout_seconds, 5);
        assert_eq!(identity.health_attempts, 30);
        assert_eq!(
            config.assignment.as_ref().expect("assignment").timeout_seconds,
            2
        );
        assert_eq!(config.api.binding_addr.port(), 9000);

        let names: Vec<String> = config
            .flow_definitions()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["browse".to_string(), "checkout".to_string()]);
    }

    #[test]
    fn out_of_range_values_are_repaired() {
        let contents = r"
min_interval: 5.0
max_interval: 1.0
scheduler:
  random_request_percentage: 250
  flow_abandon_probability: -1
  flow_step_delay_min: 4
  flow_step_delay_max: 2
  cleanup_interval_seconds: 0
flows:
  empty:
    steps: []
";
        let config = parse(contents).expect("valid config");
        assert!((config.min_interval - 1.0).abs() < f64::EPSILON);
        assert!((config.max_interval - 5.0).abs() < f64::EPSILON);
        assert!((config.scheduler.random_request_percentage - 30.0).abs() < f64::EPSILON);
        assert!((config.scheduler.flow_abandon_probability - 0.15).abs() < f64::EPSILON);
        assert!((config.scheduler.flow_step_delay_min - 2.0).abs() < f64::EPSILON);
        assert!((config.scheduler.flow_step_delay_max - 4.0).abs() < f64::EPSILON);
        assert_eq!(config.scheduler.cleanup_interval_seconds, 1);
        assert!(config.flows.is_empty());
    }

    #[test]
    fn shipped_example_parses() {
        let config = parse(include_str!("../../config/trafficgen.yaml")).expect("valid config");
        assert_eq!(config.flows.len(), 3);
        assert_eq!(config.method_map().method_for("/payment/77"), Method::Post);
        assert!(config.error_model.url_patterns.contains_key("/login"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(parse("not_a_field: 1").is_err());
    }

    #[test]
    fn regions_fall_back_to_builtin() {
        let config = parse("regions: []").expect("valid config");
        assert_eq!(config.region_table(), RegionTable::builtin());

        let contents = r"
regions:
  - name: Lab
    ranges:
      - start: 10.0.0.0
        end: 10.0.255.255
    countries:
      - name: Nowhere
        code: XX
        cities:
          - name: Testville
            lat: 1.0
            lon: 2.0
";
        let config = parse(contents).expect("valid config");
        let table = config.region_table();
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["Lab"]);
    }
}
