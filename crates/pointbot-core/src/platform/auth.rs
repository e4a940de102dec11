//! OAuth2 authorization-code flow for Twitch.
//!
//! Tokens are acquired by:
//! 1. Reusing the cached credential while it is unexpired
//! 2. Otherwise binding a local callback listener on the redirect URI
//! 3. Sending the user to the authorization URL and waiting for exactly one callback
//! 4. Exchanging the returned code at the token endpoint and caching the result
//!
//! The callback listener is shut down on every exit path so the redirect
//! port is never left bound.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use oauth2::basic::{
    BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse, BasicTokenType,
};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RefreshToken,
    RequestTokenError, Scope, StandardRevocableToken, TokenUrl,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::platform::models::{Credential, TokenResponse};
use crate::platform::storage::TokenStore;
use crate::{AppConfig, CoreError};

/// How long the callback server gets to finish in-flight responses.
const LISTENER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Body served to the browser after a good callback.
const CONFIRMATION: &str =
    "Authorization code stored successfully. You may now close this page.";

/// Errors that can occur during authentication.
#[derive(Debug, Error)]
pub enum AuthenticationError {
    /// The callback `state` did not match the generated token.
    #[error("callback state mismatch: possible CSRF attack, refusing the authorization code")]
    Csrf,

    /// The user or platform declined the authorization.
    #[error("authorization denied: {0}")]
    Denied(String),

    /// The callback was unusable (no code, listener died, ...).
    #[error("authorization callback failed: {0}")]
    Callback(String),

    /// No callback arrived in time.
    #[error("no authorization callback within {0:?}")]
    Timeout(Duration),

    /// The token endpoint rejected the request or sent an unusable reply.
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// Refresh was requested for a credential without a refresh token.
    #[error("cached credential has no refresh token - run 'pointbot auth login'")]
    NoRefreshToken,

    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The local callback listener could not be started.
    #[error("callback listener error: {0}")]
    Listener(String),

    /// The OAuth settings are unusable.
    #[error("invalid OAuth settings: {0}")]
    InvalidSettings(String),

    /// Token storage error.
    #[error("token storage error: {0}")]
    StorageError(#[from] CoreError),
}

/// Endpoints and client credentials for the authorization-code flow.
#[derive(Clone)]
pub struct OAuthSettings {
    /// Application client ID.
    pub client_id: String,
    /// Application client secret.
    pub client_secret: String,
    /// Authorization endpoint the user is sent to.
    pub authorize_url: Url,
    /// Token endpoint for code exchange and refresh.
    pub token_url: Url,
    /// Redirect URI exactly as registered with the application.
    pub redirect_uri: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Time to wait for the browser callback.
    pub callback_timeout: Duration,
}

impl OAuthSettings {
    /// Build settings from the application configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSettings` if an endpoint URL cannot be parsed.
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AuthenticationError> {
        let base = cfg.twitch.auth_base.trim_end_matches('/');
        let parse = |raw: String| {
            Url::parse(&raw).map_err(|e| AuthenticationError::InvalidSettings(format!("{raw}: {e}")))
        };

        Url::parse(&cfg.auth.redirect_url).map_err(|e| {
            AuthenticationError::InvalidSettings(format!("redirect_url {}: {e}", cfg.auth.redirect_url))
        })?;

        Ok(Self {
            client_id: cfg.twitch.client_id.clone(),
            client_secret: cfg.twitch.client_secret.clone(),
            authorize_url: parse(format!("{base}/authorize"))?,
            token_url: parse(format!("{base}/token"))?,
            redirect_uri: cfg.auth.redirect_url.clone(),
            scopes: cfg.auth.scopes.clone(),
            callback_timeout: cfg.auth.callback_timeout(),
        })
    }
}

impl fmt::Debug for OAuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("authorize_url", &self.authorize_url.as_str())
            .field("token_url", &self.token_url.as_str())
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("callback_timeout", &self.callback_timeout)
            .finish()
    }
}

/// Presents the authorization URL to the user.
pub trait Browser: fmt::Debug + Send + Sync {
    /// Show or open `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the user cannot be directed to the URL at all.
    fn open(&self, url: &Url) -> Result<(), AuthenticationError>;
}

/// Prints the URL and optionally launches the system browser.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser {
    /// Launch the default browser as well as printing.
    pub launch: bool,
}

impl Browser for SystemBrowser {
    fn open(&self, url: &Url) -> Result<(), AuthenticationError> {
        eprintln!("Visit this URL to authorize pointbot:\n  {url}");
        if self.launch
            && let Err(e) = open::that_detached(url.as_str())
        {
            log::warn!("could not launch a browser: {e}");
        }
        Ok(())
    }
}

/// `oauth2` client parameterised with the Twitch token response.
type TwitchOAuthClient = oauth2::Client<
    BasicErrorResponse,
    TokenResponse,
    BasicTokenType,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
>;

/// Acquires, refreshes and caches the OAuth credential.
#[derive(Debug)]
pub struct Authenticator {
    settings: OAuthSettings,
    store: TokenStore,
    client: TwitchOAuthClient,
    browser: Box<dyn Browser>,
}

impl Authenticator {
    /// Create an authenticator that prints the authorization URL.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSettings` if the redirect URI is not a valid URL.
    pub fn new(settings: OAuthSettings, store: TokenStore) -> Result<Self, AuthenticationError> {
        // Twitch expects the client credentials in the form body.
        let client = TwitchOAuthClient::new(
            ClientId::new(settings.client_id.clone()),
            Some(ClientSecret::new(settings.client_secret.clone())),
            AuthUrl::from_url(settings.authorize_url.clone()),
            Some(TokenUrl::from_url(settings.token_url.clone())),
        )
        .set_auth_type(AuthType::RequestBody)
        .set_redirect_uri(redirect_url(&settings.redirect_uri)?);

        Ok(Self {
            settings,
            store,
            client,
            browser: Box::new(SystemBrowser::default()),
        })
    }

    /// Replace the way the authorization URL is presented.
    #[must_use]
    pub fn with_browser(mut self, browser: impl Browser + 'static) -> Self {
        self.browser = Box::new(browser);
        self
    }

    /// The backing token store.
    #[must_use]
    pub const fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Return a usable credential, authorizing in the browser if needed.
    ///
    /// A cached, unexpired credential is returned without any network
    /// activity. Missing, expired or unreadable caches trigger a fresh
    /// authorization-code flow.
    ///
    /// # Errors
    ///
    /// Returns an error if the authorization flow fails. A CSRF mismatch is
    /// reported as `AuthenticationError::Csrf` and must abort the process.
    pub async fn acquire_token(&self) -> Result<Credential, AuthenticationError> {
        match self.store.load() {
            Ok(credential) if credential.is_usable_at(Utc::now()) => {
                log::debug!("using cached token (expires {})", credential.expiry);
                return Ok(credential);
            }
            Ok(credential) => {
                log::info!("cached token expired at {}, re-authorizing", credential.expiry);
            }
            Err(CoreError::SecretNotFound(_)) => {
                log::info!("no cached token, starting authorization");
            }
            Err(CoreError::CorruptCache(reason)) => {
                log::warn!("ignoring corrupt token cache: {reason}");
            }
            Err(e) => {
                log::warn!("could not read token cache: {e}");
            }
        }

        self.login().await
    }

    /// Authorize in the browser and cache the new credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the authorization flow fails. Failing to cache
    /// the credential is logged, not returned.
    pub async fn login(&self) -> Result<Credential, AuthenticationError> {
        let credential = self.authorize().await?;
        self.persist(&credential);
        Ok(credential)
    }

    /// The cached credential, if any, regardless of expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreadable or corrupt.
    pub fn status(&self) -> Result<Option<Credential>, AuthenticationError> {
        match self.store.load() {
            Ok(credential) => Ok(Some(credential)),
            Err(CoreError::SecretNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Run the browser authorization-code flow without consulting the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind, the callback is
    /// rejected or times out, or the code exchange fails.
    pub async fn authorize(&self) -> Result<Credential, AuthenticationError> {
        let state = CsrfToken::new_random();
        let mut listener = CallbackListener::bind(&self.settings.redirect_uri, state.secret()).await?;
        // Port 0 in the configured redirect is only known after binding.
        let client = self.client_for(listener.redirect_uri())?;
        let url = self.authorization_url(listener.redirect_uri(), &state)?;

        let outcome = match self.browser.open(&url) {
            Ok(()) => listener.wait(self.settings.callback_timeout).await,
            Err(e) => Err(e),
        };
        listener.shutdown().await;

        let code = outcome?;
        log::info!("authorization code received, exchanging for a token");
        let issued_at = Utc::now();
        let token = client
            .exchange_code(AuthorizationCode::new(code))
            .request_async(async_http_client)
            .await
            .map_err(exchange_error)?;
        Ok(token.into_credential(issued_at))
    }

    /// Exchange the refresh token for a new credential and cache it.
    ///
    /// # Errors
    ///
    /// Returns `NoRefreshToken` if none is available, or the token
    /// endpoint's error.
    pub async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthenticationError> {
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .ok_or(AuthenticationError::NoRefreshToken)?;

        let issued_at = Utc::now();
        let token = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(exchange_error)?;

        let mut fresh = token.into_credential(issued_at);
        if fresh.refresh_token.is_none() {
            fresh.refresh_token = Some(refresh_token.to_string());
        }
        self.persist(&fresh);
        Ok(fresh)
    }

    /// Forget the cached credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache file cannot be removed.
    pub fn logout(&self) -> Result<(), AuthenticationError> {
        self.store.clear()?;
        Ok(())
    }

    /// Authorization URL for `redirect_uri` carrying `state`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSettings` if `redirect_uri` is not a valid URL.
    pub fn authorization_url(&self, redirect_uri: &str, state: &CsrfToken) -> Result<Url, AuthenticationError> {
        let (url, _) = self
            .client_for(redirect_uri)?
            .authorize_url(|| state.clone())
            .add_scopes(self.settings.scopes.iter().cloned().map(Scope::new))
            .url();
        Ok(url)
    }

    fn client_for(&self, redirect_uri: &str) -> Result<TwitchOAuthClient, AuthenticationError> {
        Ok(self.client.clone().set_redirect_uri(redirect_url(redirect_uri)?))
    }

    // A failed save only costs a re-authorization on the next start.
    fn persist(&self, credential: &Credential) {
        if let Err(e) = self.store.save(credential) {
            log::error!(
                "could not cache token at {}: {e}",
                self.store.path().display()
            );
        }
    }
}

fn redirect_url(raw: &str) -> Result<RedirectUrl, AuthenticationError> {
    RedirectUrl::new(raw.to_string())
        .map_err(|e| AuthenticationError::InvalidSettings(format!("redirect URI {raw}: {e}")))
}

fn exchange_error<RE>(err: RequestTokenError<RE, BasicErrorResponse>) -> AuthenticationError
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => AuthenticationError::TokenExchange(response.to_string()),
        RequestTokenError::Request(e) => AuthenticationError::Http(format!("token request failed: {e}")),
        RequestTokenError::Parse(e, body) => AuthenticationError::TokenExchange(format!(
            "{e}: {}",
            String::from_utf8_lossy(&body)
        )),
        RequestTokenError::Other(reason) => AuthenticationError::TokenExchange(reason),
    }
}

/// Constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

fn check_callback(expected_state: &str, params: CallbackParams) -> Result<String, AuthenticationError> {
    let state_matches = params
        .state
        .as_deref()
        .is_some_and(|s| constant_time_eq(s.as_bytes(), expected_state.as_bytes()));
    if !state_matches {
        return Err(AuthenticationError::Csrf);
    }

    if let Some(error) = params.error {
        return Err(AuthenticationError::Denied(
            params.error_description.unwrap_or(error),
        ));
    }

    params
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| AuthenticationError::Callback("callback carried no code".to_string()))
}

type CallbackOutcome = Result<String, AuthenticationError>;

#[derive(Debug)]
struct CallbackState {
    expected_state: String,
    // Single use: taken by the first request on the callback path.
    outcome: Mutex<Option<oneshot::Sender<CallbackOutcome>>>,
}

async fn handle_callback(
    State(shared): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    let sender = shared.outcome.lock().ok().and_then(|mut slot| slot.take());
    let Some(sender) = sender else {
        return (
            StatusCode::GONE,
            [(header::CONNECTION, "close")],
            "This authorization request was already handled.",
        );
    };

    let outcome = check_callback(&shared.expected_state, params);
    let reply = if outcome.is_ok() {
        (StatusCode::OK, CONFIRMATION)
    } else {
        (
            StatusCode::BAD_REQUEST,
            "Authorization failed. Check the pointbot log for details.",
        )
    };
    if sender.send(outcome).is_err() {
        log::debug!("callback arrived after the flow was abandoned");
    }
    (reply.0, [(header::CONNECTION, "close")], reply.1)
}

/// Short-lived HTTP server receiving the OAuth redirect.
#[derive(Debug)]
struct CallbackListener {
    redirect_uri: String,
    outcome: Option<oneshot::Receiver<CallbackOutcome>>,
    shutdown: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl CallbackListener {
    async fn bind(redirect_uri: &str, state: &str) -> Result<Self, AuthenticationError> {
        let redirect = Url::parse(redirect_uri)
            .map_err(|e| AuthenticationError::InvalidSettings(format!("{redirect_uri}: {e}")))?;
        let host = redirect
            .host_str()
            .ok_or_else(|| AuthenticationError::InvalidSettings("redirect URI has no host".to_string()))?
            .to_string();
        let port = redirect.port_or_known_default().unwrap_or(80);

        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| AuthenticationError::Listener(format!("binding {host}:{port}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| AuthenticationError::Listener(format!("resolving bound address: {e}")))?;

        // Port 0 asks for an ephemeral port; advertise the real one.
        let redirect_uri = if port == 0 {
            let mut effective = redirect.clone();
            effective
                .set_port(Some(local.port()))
                .map_err(|()| AuthenticationError::InvalidSettings("redirect URI cannot carry a port".to_string()))?;
            effective.to_string()
        } else {
            redirect_uri.to_string()
        };

        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(CallbackState {
            expected_state: state.to_string(),
            outcome: Mutex::new(Some(tx)),
        });
        let app = Router::new()
            .route(redirect.path(), get(handle_callback))
            .with_state(shared);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let server = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(e) = served {
                log::warn!("oauth callback listener failed: {e}");
            }
        });

        log::debug!("oauth callback listener bound to {local}");
        Ok(Self {
            redirect_uri,
            outcome: Some(rx),
            shutdown,
            server: Some(server),
        })
    }

    fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    async fn wait(&mut self, limit: Duration) -> CallbackOutcome {
        let Some(rx) = self.outcome.take() else {
            return Err(AuthenticationError::Callback("callback already consumed".to_string()));
        };

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AuthenticationError::Callback(
                "listener stopped before a callback arrived".to_string(),
            )),
            Err(_) => Err(AuthenticationError::Timeout(limit)),
        }
    }

    async fn shutdown(mut self) {
        self.shutdown.cancel();
        let Some(mut server) = self.server.take() else {
            return;
        };

        match tokio::time::timeout(LISTENER_SHUTDOWN_GRACE, &mut server).await {
            Ok(Ok(())) => log::debug!("oauth callback listener stopped"),
            Ok(Err(e)) => log::warn!("oauth callback listener task failed: {e}"),
            Err(_) => {
                log::warn!("oauth callback listener did not stop in time, aborting");
                server.abort();
            }
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plays the user: follows the redirect with a code and the given state.
    #[derive(Debug, Default, Clone)]
    struct ScriptedBrowser {
        opened: Arc<AtomicUsize>,
        forged_state: Option<String>,
        silent: bool,
        port: Arc<Mutex<Option<u16>>>,
    }

    impl Browser for ScriptedBrowser {
        fn open(&self, url: &Url) -> Result<(), AuthenticationError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
            let mut callback = Url::parse(&params["redirect_uri"]).unwrap();
            *self.port.lock().unwrap() = callback.port();
            if self.silent {
                return Ok(());
            }

            let state = self
                .forged_state
                .clone()
                .unwrap_or_else(|| params["state"].clone());
            callback
                .query_pairs_mut()
                .append_pair("code", "the-code")
                .append_pair("state", &state);
            tokio::spawn(async move {
                let client = reqwest::Client::builder()
                    .pool_max_idle_per_host(0)
                    .build()
                    .unwrap();
                let _ = client.get(callback).send().await;
            });
            Ok(())
        }
    }

    fn settings(server: &MockServer) -> OAuthSettings {
        OAuthSettings {
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            authorize_url: Url::parse("https://id.example.test/oauth2/authorize").unwrap(),
            token_url: Url::parse(&server.url("/oauth2/token")).unwrap(),
            redirect_uri: "http://127.0.0.1:0/callback".to_string(),
            scopes: vec!["chat:read".to_string(), "channel:manage:redemptions".to_string()],
            callback_timeout: Duration::from_secs(10),
        }
    }

    fn credential(token: &str, expiry: chrono::DateTime<Utc>) -> Credential {
        Credential {
            access_token: token.to_string(),
            refresh_token: Some("old-refresh".to_string()),
            token_type: "bearer".to_string(),
            scopes: vec![],
            expiry,
        }
    }

    fn mock_code_exchange(server: &MockServer) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(POST)
                .path("/oauth2/token")
                .body_includes("grant_type=authorization_code")
                .body_includes("code=the-code")
                .body_includes("client_secret=secret");
            then.status(200).json_body(json!({
                "access_token": "fresh",
                "expires_in": 3600,
                "refresh_token": "new-refresh",
                "scope": ["chat:read"],
                "token_type": "bearer"
            }));
        })
    }

    #[test]
    fn callback_rejects_mismatched_state_even_with_code() {
        let params = CallbackParams {
            code: Some("abc".to_string()),
            state: Some("other".to_string()),
            ..CallbackParams::default()
        };
        assert!(matches!(check_callback("expected", params), Err(AuthenticationError::Csrf)));
    }

    #[test]
    fn callback_rejects_missing_state() {
        let params = CallbackParams {
            code: Some("abc".to_string()),
            ..CallbackParams::default()
        };
        assert!(matches!(check_callback("expected", params), Err(AuthenticationError::Csrf)));
    }

    #[test]
    fn callback_reports_denial() {
        let params = CallbackParams {
            state: Some("expected".to_string()),
            error: Some("access_denied".to_string()),
            error_description: Some("The user denied you access".to_string()),
            ..CallbackParams::default()
        };
        match check_callback("expected", params) {
            Err(AuthenticationError::Denied(msg)) => assert!(msg.contains("denied")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn callback_returns_code() {
        let params = CallbackParams {
            code: Some("abc".to_string()),
            state: Some("expected".to_string()),
            ..CallbackParams::default()
        };
        assert_eq!(check_callback("expected", params).unwrap(), "abc");
    }

    #[test]
    fn constant_time_eq_compares_whole_input() {
        assert!(constant_time_eq(b"state", b"state"));
        assert!(!constant_time_eq(b"state", b"stale"));
        assert!(!constant_time_eq(b"state", b"stat"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn authorization_url_carries_all_parameters() {
        let server = MockServer::start();
        let dir = tempfile::tempdir().unwrap();
        let auth = Authenticator::new(settings(&server), TokenStore::new(dir.path().join("t.json"))).unwrap();

        let url = auth
            .authorization_url("http://localhost:3000", &CsrfToken::new("xyz".to_string()))
            .unwrap();
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "cid");
        assert_eq!(params["redirect_uri"], "http://localhost:3000");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["scope"], "chat:read channel:manage:redemptions");
        assert_eq!(params["state"], "xyz");
    }

    #[test]
    fn settings_debug_hides_secret() {
        let server = MockServer::start();
        let rendered = format!("{:?}", settings(&server));
        assert!(!rendered.contains("\"secret\""));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn unexpired_cache_skips_network() {
        let server = MockServer::start();
        let token = mock_code_exchange(&server);
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        let cached = credential("cached", Utc::now() + TimeDelta::hours(1));
        store.save(&cached).unwrap();

        let browser = ScriptedBrowser::default();
        let auth = Authenticator::new(settings(&server), store)
            .unwrap()
            .with_browser(browser.clone());

        let got = auth.acquire_token().await.unwrap();
        assert_eq!(got, cached);
        assert_eq!(browser.opened.load(Ordering::SeqCst), 0);
        token.assert_calls(0);
    }

    #[tokio::test]
    async fn expired_cache_runs_fresh_flow() {
        let server = MockServer::start();
        let token = mock_code_exchange(&server);
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        store.save(&credential("stale", Utc::now() - TimeDelta::seconds(1))).unwrap();

        let browser = ScriptedBrowser::default();
        let auth = Authenticator::new(settings(&server), store.clone())
            .unwrap()
            .with_browser(browser.clone());

        let got = auth.acquire_token().await.unwrap();
        assert_eq!(got.access_token, "fresh");
        assert_eq!(browser.opened.load(Ordering::SeqCst), 1);
        token.assert_calls(1);
        assert_eq!(store.load().unwrap().access_token, "fresh");
    }

    #[tokio::test]
    async fn corrupt_cache_falls_back_to_flow() {
        let server = MockServer::start();
        let token = mock_code_exchange(&server);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, "][").unwrap();

        let auth = Authenticator::new(settings(&server), TokenStore::new(&path))
            .unwrap()
            .with_browser(ScriptedBrowser::default());

        assert_eq!(auth.acquire_token().await.unwrap().access_token, "fresh");
        token.assert_calls(1);
    }

    #[tokio::test]
    async fn forged_state_aborts_and_releases_port() {
        let server = MockServer::start();
        let token = mock_code_exchange(&server);
        let dir = tempfile::tempdir().unwrap();
        let browser = ScriptedBrowser {
            forged_state: Some("forged".to_string()),
            ..ScriptedBrowser::default()
        };
        let auth = Authenticator::new(settings(&server), TokenStore::new(dir.path().join("t.json")))
            .unwrap()
            .with_browser(browser.clone());

        let err = auth.acquire_token().await.unwrap_err();
        assert!(matches!(err, AuthenticationError::Csrf));
        token.assert_calls(0);

        let port = browser.port.lock().unwrap().expect("redirect port");
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn missing_callback_times_out_and_releases_port() {
        let server = MockServer::start();
        let dir = tempfile::tempdir().unwrap();
        let mut short = settings(&server);
        short.callback_timeout = Duration::from_millis(100);
        let browser = ScriptedBrowser {
            silent: true,
            ..ScriptedBrowser::default()
        };
        let auth = Authenticator::new(short, TokenStore::new(dir.path().join("t.json")))
            .unwrap()
            .with_browser(browser.clone());

        let err = auth.authorize().await.unwrap_err();
        assert!(matches!(err, AuthenticationError::Timeout(_)));

        let port = browser.port.lock().unwrap().expect("redirect port");
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn rejected_exchange_is_reported() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(400)
                .json_body(json!({ "status": 400, "message": "Invalid authorization code" }));
        });
        let dir = tempfile::tempdir().unwrap();
        let auth = Authenticator::new(settings(&server), TokenStore::new(dir.path().join("t.json")))
            .unwrap()
            .with_browser(ScriptedBrowser::default());

        match auth.acquire_token().await {
            Err(AuthenticationError::TokenExchange(reason)) => {
                assert!(reason.contains("Invalid authorization code"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unwritable_cache_still_returns_token() {
        let server = MockServer::start();
        let token = mock_code_exchange(&server);
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as the cache file.
        let auth = Authenticator::new(settings(&server), TokenStore::new(dir.path()))
            .unwrap()
            .with_browser(ScriptedBrowser::default());

        assert_eq!(auth.acquire_token().await.unwrap().access_token, "fresh");
        token.assert_calls(1);
    }

    #[tokio::test]
    async fn refresh_keeps_refresh_token_when_omitted() {
        let server = MockServer::start();
        let refresh = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth2/token")
                .body_includes("grant_type=refresh_token")
                .body_includes("refresh_token=old-refresh");
            then.status(200).json_body(json!({
                "access_token": "renewed",
                "expires_in": 14000,
                "token_type": "bearer"
            }));
        });
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        let auth = Authenticator::new(settings(&server), store.clone()).unwrap();

        let old = credential("old", Utc::now() - TimeDelta::minutes(1));
        let renewed = auth.refresh(&old).await.unwrap();
        refresh.assert_calls(1);
        assert_eq!(renewed.access_token, "renewed");
        assert_eq!(renewed.refresh_token.as_deref(), Some("old-refresh"));
        assert!(renewed.is_usable_at(Utc::now()));
        assert_eq!(store.load().unwrap(), renewed);
    }

    #[tokio::test]
    async fn refresh_without_token_fails_early() {
        let server = MockServer::start();
        let dir = tempfile::tempdir().unwrap();
        let auth = Authenticator::new(settings(&server), TokenStore::new(dir.path().join("t.json"))).unwrap();
        let mut old = credential("old", Utc::now());
        old.refresh_token = None;

        assert!(matches!(
            auth.refresh(&old).await,
            Err(AuthenticationError::NoRefreshToken)
        ));
    }

    #[test]
    fn status_reports_cache_until_logout() {
        let server = MockServer::start();
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        let auth = Authenticator::new(settings(&server), store.clone()).unwrap();
        assert!(auth.status().unwrap().is_none());

        let saved = credential("kept", Utc::now() - TimeDelta::minutes(5));
        store.save(&saved).unwrap();
        assert_eq!(auth.status().unwrap(), Some(saved));

        auth.logout().unwrap();
        auth.logout().unwrap();
        assert!(auth.status().unwrap().is_none());
    }
}
