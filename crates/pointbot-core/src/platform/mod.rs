//! Twitch API client and authentication module.
//!
//! This module provides:
//! - OAuth authorization-code flow with a local callback listener
//! - Token caching on disk
//! - A Helix client for user lookup and EventSub registration

pub mod auth;
pub mod client;
pub mod models;
pub mod storage;

pub use auth::{Authenticator, AuthenticationError, Browser, OAuthSettings, SystemBrowser};
pub use client::{EventSubRegistrar, HelixClient};
pub use models::{Credential, REDEMPTION_ADD, SubscriptionRequest, TokenResponse, User};
pub use storage::TokenStore;
pub use oauth2::CsrfToken;
