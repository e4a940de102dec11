//! Data models for the Twitch OAuth and Helix APIs.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use oauth2::basic::BasicTokenType;
use oauth2::{AccessToken, RefreshToken, Scope, TokenResponse as OAuthTokenResponse};
use serde::{Deserialize, Serialize};

/// EventSub subscription type for channel-point redemptions.
pub const REDEMPTION_ADD: &str = "channel.channel_points_custom_reward_redemption.add";

/// Upper bound on a token lifetime (ten years).
const MAX_LIFETIME_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// A cached OAuth credential.
///
/// Usable only while `now < expiry`; a refreshed or re-authorized
/// credential replaces the old one wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Bearer token for Helix calls.
    pub access_token: String,
    /// Token for the `refresh_token` grant, when the platform issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Token type reported by the token endpoint (normally `bearer`).
    pub token_type: String,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Instant after which the token must be treated as absent.
    pub expiry: DateTime<Utc>,
}

impl Credential {
    /// Whether the credential may still be used at `now`.
    #[must_use]
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry
    }

    /// Time left before expiry, zero when already expired.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> TimeDelta {
        (self.expiry - now).max(TimeDelta::zero())
    }
}

/// Response of the Twitch token endpoint.
///
/// Twitch reports `scope` as a JSON array rather than the space-separated
/// string of RFC 6749, so the standard `oauth2` response type cannot parse it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: AccessToken,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// Refresh token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,
    /// Granted scopes.
    #[serde(default)]
    pub scope: Vec<Scope>,
    /// Token type.
    #[serde(deserialize_with = "oauth2::helpers::deserialize_untagged_enum_case_insensitive")]
    pub token_type: BasicTokenType,
}

impl OAuthTokenResponse<BasicTokenType> for TokenResponse {
    fn access_token(&self) -> &AccessToken {
        &self.access_token
    }

    fn token_type(&self) -> &BasicTokenType {
        &self.token_type
    }

    fn expires_in(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.expires_in))
    }

    fn refresh_token(&self) -> Option<&RefreshToken> {
        self.refresh_token.as_ref()
    }

    fn scopes(&self) -> Option<&Vec<Scope>> {
        Some(&self.scope)
    }
}

impl TokenResponse {
    /// Turn the response into a credential expiring `expires_in` seconds after `issued_at`.
    #[must_use]
    pub fn into_credential(self, issued_at: DateTime<Utc>) -> Credential {
        // Clamp absurd lifetimes instead of overflowing the timestamp.
        let lifetime = i64::try_from(self.expires_in).unwrap_or(i64::MAX).min(MAX_LIFETIME_SECS);
        Credential {
            access_token: self.access_token.secret().clone(),
            refresh_token: self.refresh_token.map(|token| token.secret().clone()),
            token_type: self.token_type.as_ref().to_string(),
            scopes: self.scope.iter().map(|scope| scope.as_str().to_string()).collect(),
            expiry: issued_at + TimeDelta::seconds(lifetime),
        }
    }
}

/// A Helix user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Numeric user ID (as a string).
    pub id: String,
    /// Login name.
    pub login: String,
    /// Display name.
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Envelope of `GET /users`.
#[derive(Debug, Clone, Deserialize)]
pub struct UsersResponse {
    /// Matching users, possibly empty.
    pub data: Vec<User>,
}

/// Body of `POST /eventsub/subscriptions`.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    /// Subscription type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Subscription version.
    pub version: String,
    /// Condition selecting the broadcaster.
    pub condition: SubscriptionCondition,
    /// Delivery transport.
    pub transport: SubscriptionTransport,
}

impl SubscriptionRequest {
    /// Redemption subscription for `broadcaster_user_id` delivered over websocket session `session_id`.
    #[must_use]
    pub fn redemptions(broadcaster_user_id: &str, session_id: &str) -> Self {
        Self {
            kind: REDEMPTION_ADD.to_string(),
            version: "1".to_string(),
            condition: SubscriptionCondition {
                broadcaster_user_id: broadcaster_user_id.to_string(),
            },
            transport: SubscriptionTransport {
                method: "websocket".to_string(),
                session_id: session_id.to_string(),
            },
        }
    }
}

/// Subscription condition.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionCondition {
    /// Broadcaster whose events are delivered.
    pub broadcaster_user_id: String,
}

/// Subscription transport descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionTransport {
    /// Always `websocket` here.
    pub method: String,
    /// EventSub session the subscription is bound to.
    pub session_id: String,
}
