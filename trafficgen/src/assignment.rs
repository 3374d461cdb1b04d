//! Session to server assignment.
//!
//! Every started flow is announced to the assignment service. The answer is
//! informational: it is logged and otherwise ignored, and a failing service
//! never disturbs generation.

use std::{net::Ipv4Addr, time::Duration};

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config;

/// Errors produced by [`Client`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`reqwest::Error`].
    #[error("Assignment request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The service answered with an unexpected status.
    #[error("Assignment service answered {0}")]
    Status(u16),
}

/// Body of an assignment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Request {
    /// The new session.
    pub session_id: Uuid,
    /// Source address of the session.
    pub client_ip: Ipv4Addr,
    /// User of the session, if known.
    pub user_id: Option<u64>,
}

/// Client of the HTTP assignment service.
#[derive(Debug, Clone)]
pub struct Client {
    client: reqwest::Client,
    endpoint: String,
}

impl Client {
    /// Create a new [`Client`].
    ///
    /// # Errors
    ///
    /// Function will error if the HTTP client cannot be built.
    pub fn new(config: &config::Assignment) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/assign", config.url.trim_end_matches('/')),
        })
    }

    /// Ask for a server for `request`'s session.
    ///
    /// # Errors
    ///
    /// Function will error if the request fails or is not answered with 200.
    pub async fn assign(&self, request: &Request) -> Result<serde_json::Value, Error> {
        let response = self.client.post(&self.endpoint).json(request).send().await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(Error::Status(status));
        }
        Ok(response.json().await?)
    }

    /// Announce `request` in the background, logging the outcome.
    pub fn announce(&self, request: Request) {
        let client = self.clone();
        tokio::spawn(async move {
            match client.assign(&request).await {
                Ok(assignment) => {
                    debug!(session_id = %request.session_id, "session assigned: {assignment}");
                }
                Err(err) => warn!(session_id = %request.session_id, "server assignment failed: {err}"),
            }
        });
    }
}
