//! Core library for pointbot - a Twitch channel-point redemption bot.
//!
//! This crate provides:
//! - Configuration loading and management
//! - XDG-compliant path resolution
//! - Schema and example config generation
//! - Twitch OAuth, token caching and the Helix client
//! - The EventSub websocket session and redemption reactions
//! - Common types and error handling

pub mod config;
pub mod error;
pub mod eventsub;
pub mod paths;
pub mod platform;
pub mod schema;

pub use config::{
    AppConfig, AuthConfig, EventSubConfig, IdleTimeoutPolicy, LogLevel, LoggingConfig, PathsConfig,
    ReactionConfig, TwitchConfig,
};
pub use error::{CoreError, Result};
pub use eventsub::{EventSession, SessionEnd, SessionSettings, WsConnector};
pub use paths::{AppPaths, default_data_dir, default_state_dir};
pub use platform::{Authenticator, AuthenticationError, HelixClient, TokenStore};
pub use schema::{generate_example_config, generate_schema, write_generated_files};

/// Application name used for config directories and environment prefix.
pub const APP_NAME: &str = "pointbot";

/// Returns the environment variable prefix for this application.
#[must_use]
pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
