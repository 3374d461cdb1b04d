//! The control API.
//!
//! A small JSON over HTTP surface over [`Control`]. Every route answers a JSON
//! object; rejected requests answer 400 with `{"error": ...}` and leave the
//! generator untouched. Bodies over [`MAX_BODY_BYTES`] answer 413.
//!
//! ## Metrics
//!
//! `api_requests_total`: Requests received, by `endpoint` and `method`
//!

use std::{net::SocketAddr, time::Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited, combinators::BoxBody};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics::counter;
use serde::Deserialize;
use serde_json::{Value, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::{net::TcpListener, pin, task::JoinSet};
use tracing::{debug, error, info};

use crate::{config, control::Control, signals::Watcher};

/// Routes that count under their own `endpoint` label.
const ENDPOINTS: [&str; 8] = [
    "/",
    "/status",
    "/update_interval",
    "/simulate_ddos",
    "/traffic/start",
    "/traffic/stop",
    "/traffic/resume",
    "/traffic/pause",
];

/// Largest request body the API reads.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Errors produced by [`Api`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IntervalUpdate {
    min_interval: f64,
    max_interval: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DdosRequest {
    duration_seconds: f64,
    #[serde(default)]
    region: Option<String>,
}

/// The control API server.
#[derive(Debug)]
pub struct Api {
    listener: TcpListener,
    control: Control,
    shutdown: Watcher,
}

impl Api {
    /// Bind the API to `config.binding_addr`.
    ///
    /// # Errors
    ///
    /// Function will error if the address cannot be bound.
    pub async fn bind(config: &config::Api, control: Control, shutdown: Watcher) -> Result<Self, Error> {
        let listener = TcpListener::bind(config.binding_addr).await?;
        Ok(Self {
            listener,
            control,
            shutdown,
        })
    }

    /// The address actually bound.
    ///
    /// # Errors
    ///
    /// Function will error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until a shutdown signal is received, then wait for open
    /// connections to finish.
    ///
    /// # Errors
    ///
    /// None known. Per connection errors are logged.
    pub async fn run(self) -> Result<(), Error> {
        let Self {
            listener,
            control,
            shutdown,
        } = self;
        if let Ok(addr) = listener.local_addr() {
            info!("control API listening on {addr}");
        }
        let mut join_set = JoinSet::new();

        let shutdown_fut = shutdown.recv();
        pin!(shutdown_fut);
        loop {
            tokio::select! {
                () = &mut shutdown_fut => {
                    info!("Shutdown signal received, stopping accept loop.");
                    break;
                }

                incoming = listener.accept() => {
                    let (stream, addr) = match incoming {
                        Ok(sa) => sa,
                        Err(e) => {
                            error!("Error accepting connection: {e}");
                            continue;
                        }
                    };
                    debug!("Accepted connection from {addr}");

                    let control = control.clone();
                    join_set.spawn(async move {
                        let service = hyper::service::service_fn(move |req| srv(req, control.clone()));
                        let builder = auto::Builder::new(TokioExecutor::new());
                        if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
                            error!("Error serving {addr}: {e}");
                        }
                    });
                }
            }
        }

        drop(listener);
        while join_set.join_next().await.is_some() {}
        Ok(())
    }
}

async fn srv(
    req: Request<hyper::body::Incoming>,
    control: Control,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let (status, value) = match read_body(body).await {
        Ok(bytes) => route(&control, &parts.method, parts.uri.path(), &bytes),
        Err(rejection) => rejection,
    };
    Ok(build_response(status, &value))
}

async fn read_body<B>(body: B) -> Result<Bytes, (StatusCode, Value)>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => {
            debug!("request body over {MAX_BODY_BYTES} bytes refused");
            Err((
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({"error": "Request body too large"}),
            ))
        }
        Err(e) => Err(rejected(format!("Could not read request body: {e}"))),
    }
}

/// Answer one request against `control`.
fn route(control: &Control, method: &Method, path: &str, body: &[u8]) -> (StatusCode, Value) {
    let endpoint = ENDPOINTS
        .iter()
        .find(|endpoint| **endpoint == path)
        .copied()
        .unwrap_or("unknown");
    counter!("api_requests_total", "endpoint" => endpoint, "method" => method.to_string())
        .increment(1);

    match (method, path) {
        (&Method::GET, "/") => (StatusCode::OK, root(control)),
        (&Method::GET, "/status") => (StatusCode::OK, json!(control.status(Instant::now()))),
        (&Method::POST, "/update_interval") => update_interval(control, body),
        (&Method::POST, "/simulate_ddos") => simulate_ddos(control, body),
        (&Method::POST, "/traffic/start" | "/traffic/resume") => {
            if control.start() {
                (
                    StatusCode::OK,
                    json!({
                        "status": "success",
                        "message": "Traffic generation started",
                        "traffic_enabled": true,
                    }),
                )
            } else {
                (
                    StatusCode::OK,
                    json!({"status": "info", "message": "Traffic generation is already running"}),
                )
            }
        }
        (&Method::POST, "/traffic/stop" | "/traffic/pause") => {
            if control.stop() {
                (
                    StatusCode::OK,
                    json!({
                        "status": "success",
                        "message": "Traffic generation stopped",
                        "traffic_enabled": false,
                    }),
                )
            } else {
                (
                    StatusCode::OK,
                    json!({"status": "info", "message": "Traffic generation is already stopped"}),
                )
            }
        }
        _ => {
            debug!("no route for {method} {path}");
            (StatusCode::NOT_FOUND, json!({"error": "Not Found"}))
        }
    }
}

fn root(control: &Control) -> Value {
    let status = control.status(Instant::now());
    json!({
        "service": "Traffic Generator API",
        "status": if status.traffic_enabled { "running" } else { "paused" },
        "config": {
            "traffic_enabled": status.traffic_enabled,
            "min_interval": status.min_interval,
            "max_interval": status.max_interval,
            "ddos_active": status.ddos_active,
            "ddos_region": status.ddos_region,
        },
    })
}

fn rejected(message: impl std::fmt::Display) -> (StatusCode, Value) {
    (StatusCode::BAD_REQUEST, json!({"error": message.to_string()}))
}

fn update_interval(control: &Control, body: &[u8]) -> (StatusCode, Value) {
    let update: IntervalUpdate = match serde_json::from_slice(body) {
        Ok(update) => update,
        Err(e) => return rejected(format!("Invalid request body: {e}")),
    };
    match control.update_interval(update.min_interval, update.max_interval) {
        Ok(()) => (
            StatusCode::OK,
            json!({
                "status": "success",
                "message": "Interval updated",
                "min_interval": update.min_interval,
                "max_interval": update.max_interval,
            }),
        ),
        Err(e) => rejected(e),
    }
}

fn simulate_ddos(control: &Control, body: &[u8]) -> (StatusCode, Value) {
    let request: DdosRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return rejected(format!("Invalid request body: {e}")),
    };
    let mut rng = rand::rng();
    let target = match control.simulate_ddos(
        &mut rng,
        request.duration_seconds,
        request.region.as_deref(),
        Instant::now(),
    ) {
        Ok(target) => target,
        Err(e) => return rejected(e),
    };
    let end_time = std::time::Duration::try_from_secs_f64(request.duration_seconds)
        .ok()
        .and_then(|duration| OffsetDateTime::now_utc().checked_add(duration.try_into().ok()?))
        .and_then(|end| end.format(&Rfc3339).ok());
    (
        StatusCode::OK,
        json!({
            "status": "success",
            "message": format!("DDoS simulation started from {}", target.region),
            "region": target.region,
            "client_ip": target.client_ip,
            "duration_seconds": request.duration_seconds,
            "end_time": end_time,
        }),
    )
}

fn build_response(status: StatusCode, value: &Value) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = value.to_string();
    match Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(crate::full(body))
    {
        Ok(resp) => resp,
        Err(e) => {
            error!("Error building response: {e}");
            let mut resp = Response::new(crate::full(Bytes::from_static(b"{}")));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http_body_util::Full;
    use trafficgen_payload::RegionTable;

    use super::*;
    use crate::signals;

    fn control() -> Control {
        Control::new(true, 0.1, 3.0, Arc::new(RegionTable::builtin()))
    }

    #[test]
    fn status_reports_settings() {
        let control = control();
        control.set_active_flows(2);
        let (status, value) = route(&control, &Method::GET, "/status", b"");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["traffic_enabled"], true);
        assert_eq!(value["active_flows"], 2);
        assert_eq!(value["ddos_active"], false);
        assert_eq!(value["ddos_region"], Value::Null);
        assert_eq!(value["ddos_remaining"], 0.0);
    }

    #[test]
    fn root_reports_service_and_config() {
        let control = control();
        control.stop();
        let (status, value) = route(&control, &Method::GET, "/", b"");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["service"], "Traffic Generator API");
        assert_eq!(value["status"], "paused");
        assert_eq!(value["config"]["max_interval"], 3.0);
    }

    #[test]
    fn invalid_interval_is_rejected() {
        let control = control();
        let (status, value) = route(
            &control,
            &Method::POST,
            "/update_interval",
            br#"{"min_interval": 2.0, "max_interval": 1.0}"#,
        );
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            value["error"],
            "min_interval must be less than or equal to max_interval"
        );

        let (status, _) = route(&control, &Method::POST, "/update_interval", b"not json");
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let snapshot = control.snapshot(Instant::now());
        assert!((snapshot.min_interval - 0.1).abs() < f64::EPSILON);
        assert!((snapshot.max_interval - 3.0).abs() < f64::EPSILON);

        let (status, value) = route(
            &control,
            &Method::POST,
            "/update_interval",
            br#"{"min_interval": 0.5, "max_interval": 1.0}"#,
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["status"], "success");
        assert!((control.snapshot(Instant::now()).max_interval - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ddos_activation() {
        let control = control();
        let (status, value) = route(
            &control,
            &Method::POST,
            "/simulate_ddos",
            br#"{"duration_seconds": 0}"#,
        );
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["error"], "Duration must be positive");

        let (status, value) = route(
            &control,
            &Method::POST,
            "/simulate_ddos",
            br#"{"duration_seconds": 30, "region": "Asia"}"#,
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["region"], "Asia");
        assert!(value["end_time"].is_string());

        let (_, value) = route(&control, &Method::GET, "/status", b"");
        assert_eq!(value["ddos_active"], true);
        assert_eq!(value["ddos_region"], "Asia");
    }

    #[test]
    fn start_and_stop_aliases() {
        let control = control();
        let (_, value) = route(&control, &Method::POST, "/traffic/start", b"");
        assert_eq!(value["status"], "info");
        let (_, value) = route(&control, &Method::POST, "/traffic/pause", b"");
        assert_eq!(value["status"], "success");
        assert!(!control.is_enabled());
        let (_, value) = route(&control, &Method::POST, "/traffic/stop", b"");
        assert_eq!(value["status"], "info");
        let (_, value) = route(&control, &Method::POST, "/traffic/resume", b"");
        assert_eq!(value["status"], "success");
        assert!(control.is_enabled());
    }

    #[test]
    fn unknown_routes_are_not_found() {
        let control = control();
        let (status, _) = route(&control, &Method::GET, "/nope", b"");
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = route(&control, &Method::GET, "/update_interval", b"");
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversized_bodies_are_refused() {
        let body = Full::new(Bytes::from(vec![b' '; MAX_BODY_BYTES + 1]));
        let (status, value) = read_body(body).await.expect_err("body over the limit");
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(value["error"], "Request body too large");

        let payload = br#"{"min_interval": 0.5, "max_interval": 1.0}"#;
        let bytes = read_body(Full::new(Bytes::from_static(payload)))
            .await
            .expect("small body is read");
        assert_eq!(&bytes[..], payload);
    }

    #[tokio::test]
    async fn serves_over_http_until_shutdown() {
        let control = control();
        let (watcher, broadcaster) = signals::signal();
        let api = Api::bind(
            &config::Api {
                binding_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            },
            control.clone(),
            watcher,
        )
        .await
        .expect("bind succeeds");
        let addr = api.local_addr().expect("bound address");
        let server = tokio::spawn(api.run());

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/traffic/stop"))
            .send()
            .await
            .expect("request succeeds");
        assert_eq!(response.status().as_u16(), 200);
        assert!(!control.is_enabled());

        let response = client
            .get(format!("http://{addr}/status"))
            .send()
            .await
            .expect("request succeeds");
        let value: Value = response.json().await.expect("json body");
        assert_eq!(value["traffic_enabled"], false);
        drop(client);

        broadcaster.signal_and_wait().await;
        server
            .await
            .expect("server task joins")
            .expect("server exits cleanly");
    }
}
