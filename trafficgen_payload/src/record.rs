//! Structured access-log records.
//!
//! A [`LogRecord`] is built from the [`RequestContext`] the generator
//! assembled and the [`Outcome`] the error model decided on. It serializes as
//! one JSON object, one record per line.

use std::net::Ipv4Addr;

use serde::Serialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::{Error, Geocode, Method, Outcome};

const HTTP_VERSION: &str = "1.1";

/// Severity of a record, derived from its status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    /// Status below 400.
    Info,
    /// Status in `[400, 500)`.
    Warn,
    /// Status 500 and above.
    Error,
}

impl Level {
    /// The level a response with `status` is logged at.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            0..400 => Self::Info,
            400..500 => Self::Warn,
            _ => Self::Error,
        }
    }
}

/// Identity of a simulated user, shared by every request of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct UserContext {
    /// Source address of the user's requests.
    pub client_ip: Ipv4Addr,
    /// User agent the user's browser sends.
    pub user_agent: String,
    /// Identifier from the identity service, absent for anonymous users.
    pub user_id: Option<u64>,
    /// User name, from the identity service or made up locally.
    pub user_name: String,
    /// Where `client_ip` is located.
    pub geocode: Option<Geocode>,
}

/// Everything known about one request before its outcome is decided.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    /// Requested URL path.
    pub url: String,
    /// Request method.
    pub method: Method,
    /// Source address.
    pub client_ip: Ipv4Addr,
    /// Location of `client_ip`.
    pub geocode: Option<Geocode>,
    /// Identifier of the requesting user, if authenticated.
    pub user_id: Option<u64>,
    /// Name of the requesting user.
    pub user_name: String,
    /// User agent string.
    pub user_agent: String,
    /// Session the request belongs to.
    pub session_id: Uuid,
    /// Name of the flow the request is a step of.
    pub flow_name: Option<String>,
    /// Whether the request is part of a DDoS burst.
    pub ddos: bool,
}

impl RequestContext {
    /// Build the context for a request made by `user`.
    #[must_use]
    pub fn for_user(user: &UserContext, url: String, method: Method, session_id: Uuid) -> Self {
        Self {
            url,
            method,
            client_ip: user.client_ip,
            geocode: user.geocode.clone(),
            user_id: user.user_id,
            user_name: user.user_name.clone(),
            user_agent: user.user_agent.clone(),
            session_id,
            flow_name: None,
            ddos: false,
        }
    }

    /// Whether the request carries a known user id.
    #[must_use]
    pub fn authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct HttpRequest {
    method: Method,
    referrer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct HttpResponse {
    status_code: u16,
    bytes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Http {
    request: HttpRequest,
    response: HttpResponse,
    url: String,
    version: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct UserAgent {
    original: String,
}

/// One emitted access-log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    timestamp: String,
    level: Level,
    client_ip: Ipv4Addr,
    user_id: Option<u64>,
    user_name: String,
    session_id: Uuid,
    http: Http,
    user_agent: UserAgent,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flow_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    geocode: Option<Geocode>,
}

impl LogRecord {
    /// Assemble a record.
    ///
    /// # Errors
    ///
    /// Function will error if `at` cannot be formatted as RFC 3339.
    pub fn new(
        ctx: RequestContext,
        outcome: Outcome,
        referrer: String,
        at: OffsetDateTime,
    ) -> Result<Self, Error> {
        let timestamp = at.format(&Rfc3339)?;
        let message = format!("{} {} - {}", ctx.method, ctx.url, outcome.status);
        let error = (outcome.status >= 400).then_some(outcome.message);
        Ok(Self {
            timestamp,
            level: Level::from_status(outcome.status),
            client_ip: ctx.client_ip,
            user_id: ctx.user_id,
            user_name: ctx.user_name,
            session_id: ctx.session_id,
            http: Http {
                request: HttpRequest {
                    method: ctx.method,
                    referrer,
                },
                response: HttpResponse {
                    status_code: outcome.status,
                    bytes: outcome.bytes,
                },
                url: ctx.url,
                version: HTTP_VERSION,
            },
            user_agent: UserAgent {
                original: ctx.user_agent,
            },
            message,
            error,
            flow_name: ctx.flow_name,
            geocode: ctx.geocode,
        })
    }

    /// Severity of the record.
    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    /// Response status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.http.response.status_code
    }

    /// Response size in bytes.
    #[must_use]
    pub fn bytes(&self) -> u32 {
        self.http.response.bytes
    }

    /// Request method.
    #[must_use]
    pub fn method(&self) -> Method {
        self.http.request.method
    }

    /// Requested URL path.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.http.url
    }

    /// Source address.
    #[must_use]
    pub fn client_ip(&self) -> Ipv4Addr {
        self.client_ip
    }

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// User identifier, if authenticated.
    #[must_use]
    pub fn user_id(&self) -> Option<u64> {
        self.user_id
    }

    /// User agent string.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent.original
    }

    /// Flow the record belongs to.
    #[must_use]
    pub fn flow_name(&self) -> Option<&str> {
        self.flow_name.as_deref()
    }

    /// Location of the client.
    #[must_use]
    pub fn geocode(&self) -> Option<&Geocode> {
        self.geocode.as_ref()
    }

    /// Error description, present for statuses of 400 and above.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Serialize as a single line of JSON, without the trailing newline.
    ///
    /// # Errors
    ///
    /// Function will error if serialization fails.
    pub fn to_json_line(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}
