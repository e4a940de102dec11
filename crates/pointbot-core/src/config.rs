//! Configuration types and loading for the application.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use config::{Config, Environment, File, FileFormat};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CoreError;
use crate::paths::{expand_str_path, write_default_config};
use crate::{AppPaths, env_prefix};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(
    title = "Application Configuration",
    description = "Main configuration for the application"
)]
pub struct AppConfig {
    /// JSON Schema reference for editor support.
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub schema: Option<String>,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Custom paths for data and state directories.
    pub paths: PathsConfig,

    /// Twitch application credentials and endpoints.
    pub twitch: TwitchConfig,

    /// OAuth authorization-code flow settings.
    pub auth: AuthConfig,

    /// EventSub websocket session settings.
    pub eventsub: EventSubConfig,

    /// Automated reactions to channel-point redemptions.
    pub reactions: ReactionConfig,
}

impl AppConfig {
    /// Load configuration from file and environment, creating defaults if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read, parsed, or written.
    pub fn load(paths: &AppPaths, dry_run: bool) -> Result<Self> {
        if !paths.config_file.exists() {
            if dry_run {
                log::info!(
                    "dry-run: would create default config at {}",
                    paths.config_file.display()
                );
            } else {
                write_default_config(&paths.config_file)?;
            }
        }

        Self::load_from_path(&paths.config_file)
    }

    /// Load configuration from a specific path.
    ///
    /// `TWITCH_CLIENT_ID` and `TWITCH_CLIENT_SECRET` take precedence over
    /// both the file and the prefixed environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed.
    pub fn load_from_path(config_file: &Path) -> Result<Self> {
        let env_prefix = env_prefix();
        let built = Config::builder()
            .set_default("logging.level", "info")?
            .add_source(
                File::from(config_file)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
            .set_override_option("twitch.client_id", std::env::var("TWITCH_CLIENT_ID").ok())?
            .set_override_option(
                "twitch.client_secret",
                std::env::var("TWITCH_CLIENT_SECRET").ok(),
            )?
            .build()?;

        let mut config: Self = built.try_deserialize()?;

        if let Some(ref file) = config.logging.file {
            let expanded = expand_str_path(file)?;
            config.logging.file = Some(expanded.display().to_string());
        }

        Ok(config)
    }

    /// Check that everything needed to talk to Twitch is present.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` naming every missing or invalid setting.
    pub fn validate(&self) -> crate::Result<()> {
        let mut problems = Vec::new();

        if self.twitch.client_id.trim().is_empty() {
            problems.push("twitch.client_id is not set (or TWITCH_CLIENT_ID)".to_string());
        }
        if self.twitch.client_secret.trim().is_empty() {
            problems.push("twitch.client_secret is not set (or TWITCH_CLIENT_SECRET)".to_string());
        }
        if self.twitch.broadcaster_login.trim().is_empty() {
            problems.push("twitch.broadcaster_login is not set".to_string());
        }
        if let Err(e) = Url::parse(&self.auth.redirect_url) {
            problems.push(format!("auth.redirect_url is invalid: {e}"));
        }
        if let Err(e) = Url::parse(&self.eventsub.websocket_url) {
            problems.push(format!("eventsub.websocket_url is invalid: {e}"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Config(problems.join("; ")))
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "Logging configuration")]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace).
    #[schemars(default = "default_log_level")]
    pub level: LogLevel,

    /// Optional path for log file output. Supports ~ and environment variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Log level enumeration for schema validation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only emit error-level messages.
    Error,
    /// Emit warnings and errors.
    Warn,
    /// Emit informational messages and above (default).
    #[default]
    Info,
    /// Emit debug diagnostics and above.
    Debug,
    /// Emit all messages including fine-grained traces.
    Trace,
}

impl LogLevel {
    /// Convert to the `log` crate's filter.
    #[must_use]
    pub const fn as_filter(self) -> log::LevelFilter {
        match self {
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warn => write!(f, "warn"),
            Self::Info => write!(f, "info"),
            Self::Debug => write!(f, "debug"),
            Self::Trace => write!(f, "trace"),
        }
    }
}

const fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: None,
        }
    }
}

/// Path override configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "Custom paths for data and state directories")]
pub struct PathsConfig {
    /// Directory for persistent data. Supports ~ and environment variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Directory for state files. Supports ~ and environment variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
}

/// Twitch application settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "Twitch application credentials and endpoints")]
pub struct TwitchConfig {
    /// Application client ID from the Twitch developer console.
    pub client_id: String,

    /// Application client secret. Prefer the `TWITCH_CLIENT_SECRET` variable.
    pub client_secret: String,

    /// Login name of the channel whose redemptions are watched.
    pub broadcaster_login: String,

    /// Base URL of the Helix API.
    pub api_base: String,

    /// Base URL of the OAuth2 endpoints (`/authorize`, `/token`).
    pub auth_base: String,
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            broadcaster_login: String::new(),
            api_base: "https://api.twitch.tv/helix".to_string(),
            auth_base: "https://id.twitch.tv/oauth2".to_string(),
        }
    }
}

/// OAuth authorization-code flow settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "OAuth authorization-code flow settings")]
pub struct AuthConfig {
    /// Redirect URI registered with the application. A local listener is
    /// bound to its host and port while waiting for the callback.
    pub redirect_url: String,

    /// Scopes requested during authorization.
    pub scopes: Vec<String>,

    /// Token cache file. Defaults to `token.json` in the state directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,

    /// Seconds to wait for the browser callback before giving up.
    #[schemars(range(min = 1))]
    pub callback_timeout_secs: u64,

    /// Launch the system browser in addition to printing the URL.
    pub open_browser: bool,
}

impl AuthConfig {
    /// Callback wait limit as a `Duration`.
    #[must_use]
    pub const fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            redirect_url: "http://localhost:3000".to_string(),
            scopes: [
                "channel:manage:redemptions",
                "chat:edit",
                "chat:read",
                "channel:moderate",
                "whispers:read",
                "whispers:edit",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            token_file: None,
            callback_timeout_secs: 300,
            open_browser: false,
        }
    }
}

/// What the session loop does when the keep-alive deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdleTimeoutPolicy {
    /// End the session and exit cleanly.
    #[default]
    Exit,
    /// Open a fresh connection and subscribe again.
    Reconnect,
}

/// EventSub websocket session settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "EventSub websocket session settings")]
pub struct EventSubConfig {
    /// Websocket endpoint for new sessions.
    pub websocket_url: String,

    /// Idle deadline in seconds used until the welcome frame arrives.
    #[schemars(range(min = 1))]
    pub initial_keepalive_secs: u64,

    /// Seconds added to the server-advertised keep-alive timeout.
    pub keepalive_margin_secs: u64,

    /// Behaviour when no frame arrives before the idle deadline.
    pub on_idle_timeout: IdleTimeoutPolicy,
}

impl EventSubConfig {
    /// Idle deadline before the welcome frame.
    #[must_use]
    pub const fn initial_keepalive(&self) -> Duration {
        Duration::from_secs(self.initial_keepalive_secs)
    }

    /// Safety margin on top of the server keep-alive.
    #[must_use]
    pub const fn keepalive_margin(&self) -> Duration {
        Duration::from_secs(self.keepalive_margin_secs)
    }
}

impl Default for EventSubConfig {
    fn default() -> Self {
        Self {
            websocket_url: "wss://eventsub.wss.twitch.tv/ws".to_string(),
            initial_keepalive_secs: 30,
            keepalive_margin_secs: 2,
            on_idle_timeout: IdleTimeoutPolicy::Exit,
        }
    }
}

/// Redemption reaction settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "Automated reactions to channel-point redemptions")]
pub struct ReactionConfig {
    /// Reward title that triggers the reaction.
    pub trigger_title: String,

    /// Program and arguments receiving the redeemer's text on stdin.
    /// Leave empty to only log the text.
    pub command: Vec<String>,
}

impl Default for ReactionConfig {
    fn default() -> Self {
        Self {
            trigger_title: "TTS".to_string(),
            command: vec!["festival".to_string(), "--tts".to_string()],
        }
    }
}
