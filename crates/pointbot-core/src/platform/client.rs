//! Helix API client.
//!
//! Only the two calls the bot needs are implemented:
//!
//! 1. `GET /users?login=` to resolve the broadcaster's numeric ID
//! 2. `POST /eventsub/subscriptions` to bind redemptions to a websocket session
//!
//! Every request carries the bearer token and the application client ID.
//! The websocket transport is owned by `EventSession`; closing this client
//! only releases its HTTP connection pool.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};

use crate::CoreError;
use crate::platform::models::{Credential, SubscriptionRequest, UsersResponse};

/// Registers EventSub subscriptions for a session.
#[async_trait]
pub trait EventSubRegistrar: fmt::Debug + Send + Sync {
    /// Subscribe `session_id` to redemptions on `broadcaster_user_id`'s channel.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Subscription` when the platform does not accept
    /// the subscription.
    async fn subscribe(&self, broadcaster_user_id: &str, session_id: &str) -> Result<(), CoreError>;
}

/// Authenticated Helix client.
pub struct HelixClient {
    // `None` once closed.
    http_client: Mutex<Option<Client>>,
    api_base: String,
    client_id: String,
    access_token: String,
}

impl HelixClient {
    /// Create a client for `api_base` using `credential`.
    ///
    /// # Errors
    ///
    /// Returns an error if HTTP client creation fails.
    pub fn new(api_base: &str, client_id: &str, credential: &Credential) -> Result<Self, CoreError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CoreError::Other(format!("creating HTTP client: {e}")))?;

        Ok(Self {
            http_client: Mutex::new(Some(http_client)),
            api_base: api_base.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            access_token: credential.access_token.clone(),
        })
    }

    /// Resolve a login name to the platform's user ID.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` when no user matches, or an API error.
    pub async fn resolve_user_id(&self, login: &str) -> Result<String, CoreError> {
        let http = self.http()?;

        let response = self
            .authorized(http.get(format!("{}/users", self.api_base)))
            .query(&[("login", login)])
            .send()
            .await
            .map_err(|e| CoreError::Api(format!("user lookup failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::Api(format!("user lookup failed: {status} - {text}")));
        }

        let users: UsersResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Serialization(format!("parsing users response: {e}")))?;

        let user = users
            .data
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::NotFound(format!("no user with login '{login}'")))?;

        log::debug!("resolved {login} to user id {}", user.id);
        Ok(user.id)
    }

    /// Drop the HTTP client and its pooled connections. Later calls fail
    /// with `CoreError::Closed`.
    pub fn close(&self) {
        if self.slot().take().is_some() {
            log::debug!("helix client closed");
        }
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.slot().is_none()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Client>> {
        self.http_client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn http(&self) -> Result<Client, CoreError> {
        self.slot().clone().ok_or(CoreError::Closed)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.access_token)
            .header("Client-Id", &self.client_id)
    }
}

#[async_trait]
impl EventSubRegistrar for HelixClient {
    async fn subscribe(&self, broadcaster_user_id: &str, session_id: &str) -> Result<(), CoreError> {
        let http = self.http()?;
        let request = SubscriptionRequest::redemptions(broadcaster_user_id, session_id);

        let response = self
            .authorized(http.post(format!("{}/eventsub/subscriptions", self.api_base)))
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::Api(format!("subscription request failed: {e}")))?;

        let status = response.status();
        if status != StatusCode::ACCEPTED {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Subscription {
                status: status.as_u16(),
                body,
            });
        }

        log::info!(
            "subscribed to {} for session {}",
            request.kind,
            session_id
        );
        Ok(())
    }
}

impl fmt::Debug for HelixClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelixClient")
            .field("api_base", &self.api_base)
            .field("client_id", &self.client_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
