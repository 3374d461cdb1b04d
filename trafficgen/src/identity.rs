//! User identities.
//!
//! Requests are attributed to users the identity service knows about. When
//! that service is absent or failing the generator makes a name up and
//! leaves the id empty, so a broken collaborator only ever costs realism.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, info, warn};
use trafficgen_payload::request::fallback_user_name;

use crate::{config, signals::Watcher};

/// Errors produced by [`Directory`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`reqwest::Error`].
    #[error("Identity request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The service answered with an unexpected status.
    #[error("Identity service answered {0}")]
    Status(u16),
    /// No identity service is configured.
    #[error("No identity service configured")]
    Offline,
}

/// A user as known by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identity {
    /// Service assigned id, absent for made up users.
    pub id: Option<u64>,
    /// User name.
    pub name: String,
}

impl Identity {
    /// A made up, anonymous, identity.
    pub fn fallback<R>(rng: &mut R) -> Self
    where
        R: Rng + ?Sized,
    {
        Self {
            id: None,
            name: fallback_user_name(rng),
        }
    }
}

/// A source of user identities.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Fetch a random user.
    async fn fetch(&self) -> Result<Identity, Error>;

    /// Whether the directory is able to answer.
    async fn healthy(&self) -> bool;
}

/// Look up a user, falling back to a made up identity on any failure.
pub async fn lookup<D, R>(directory: &D, rng: &mut R) -> Identity
where
    D: Directory + ?Sized,
    R: Rng + ?Sized,
{
    match directory.fetch().await {
        Ok(identity) => identity,
        Err(Error::Offline) => Identity::fallback(rng),
        Err(err) => {
            debug!("identity lookup failed, using fallback user: {err}");
            Identity::fallback(rng)
        }
    }
}

/// Poll `directory` until it reports healthy, `attempts` times at most,
/// `delay` apart. Returns whether it became healthy. Returns early, unhealthy,
/// if `shutdown` fires.
pub async fn wait_ready<D>(directory: &D, attempts: u32, delay: Duration, shutdown: &mut Watcher) -> bool
where
    D: Directory + ?Sized,
{
    for attempt in 1..=attempts {
        if directory.healthy().await {
            info!("identity service is ready");
            return true;
        }
        debug!("identity service not ready, attempt {attempt} of {attempts}");
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
        if shutdown.try_recv() {
            return false;
        }
    }
    warn!("identity service not responding, continuing with fallback users");
    false
}

/// Client of the HTTP identity service.
#[derive(Debug, Clone)]
pub struct UserDatabase {
    client: reqwest::Client,
    base: String,
    timeout: Duration,
}

impl UserDatabase {
    /// Create a new [`UserDatabase`] client.
    ///
    /// # Errors
    ///
    /// Function will error if the HTTP client cannot be built.
    pub fn new(config: &config::Identity) -> Result<Self, Error> {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: config.url.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl Directory for UserDatabase {
    async fn fetch(&self) -> Result<Identity, Error> {
        let response = self
            .client
            .get(format!("{}/user/random", self.base))
            .timeout(self.timeout)
            .send()
            .await?;
        let status = response.status().as_u16();
        if status != 200 && status != 201 {
            return Err(Error::Status(status));
        }
        let user: User = response.json().await?;
        Ok(Identity {
            id: Some(user.id),
            name: user.name,
        })
    }

    async fn healthy(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.base))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(response) => response.status().as_u16() == 200,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct User {
    id: u64,
    name: String,
}

/// A directory with nobody in it; every lookup falls back.
#[derive(Debug, Clone, Copy, Default)]
pub struct Offline;

#[async_trait]
impl Directory for Offline {
    async fn fetch(&self) -> Result<Identity, Error> {
        Err(Error::Offline)
    }

    async fn healthy(&self) -> bool {
        true
    }
}
