//! Decoding of EventSub websocket frames.
//!
//! A frame is classified by `metadata.message_type` first and, for
//! notifications, by `metadata.subscription_type` second. Anything
//! unrecognized at either level is kept with its raw text so the session
//! can log it and carry on.

use serde::Deserialize;
use serde_json::Value;

use crate::CoreError;
use crate::platform::models::REDEMPTION_ADD;

/// Session descriptor carried by welcome and reconnect frames.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionInfo {
    /// Session ID used when subscribing.
    pub id: String,
    /// Session status (`connected`, `reconnecting`, ...).
    #[serde(default)]
    pub status: String,
    /// Connection timestamp as sent by the platform.
    #[serde(default)]
    pub connected_at: String,
    /// Seconds without traffic after which the connection is considered dead.
    #[serde(default)]
    pub keepalive_timeout_seconds: Option<u64>,
    /// Where to reconnect, present on reconnect frames.
    #[serde(default)]
    pub reconnect_url: Option<String>,
}

/// Reward attached to a redemption.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Reward {
    /// Reward ID.
    pub id: String,
    /// Reward title as shown to viewers.
    pub title: String,
    /// Cost in channel points.
    #[serde(default)]
    pub cost: u64,
    /// Reward description.
    #[serde(default)]
    pub prompt: String,
}

/// A channel-point redemption.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RedemptionEvent {
    /// Redemption ID.
    pub id: String,
    /// Login of the viewer who redeemed.
    #[serde(default)]
    pub user_login: String,
    /// Display name of the viewer who redeemed.
    #[serde(default)]
    pub user_name: String,
    /// Text the viewer entered, empty for rewards without input.
    #[serde(default)]
    pub user_input: String,
    /// The redeemed reward.
    pub reward: Reward,
    /// Channel the reward belongs to.
    #[serde(default)]
    pub broadcaster_user_login: String,
}

/// Notification payload, by subscription type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `channel.channel_points_custom_reward_redemption.add`
    RewardRedemption(Box<RedemptionEvent>),
    /// A subscription type this bot does not handle.
    Unrecognized {
        /// The subscription type from the frame metadata.
        subscription_type: String,
        /// The frame as received.
        raw: String,
    },
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// `session_welcome`
    Welcome(SessionInfo),
    /// `notification`
    Notification(Notification),
    /// `session_keepalive`
    Keepalive,
    /// `session_reconnect`
    Reconnect(SessionInfo),
    /// `revocation`
    Revocation {
        /// Type of the revoked subscription.
        subscription_type: String,
        /// Reason given by the platform.
        status: String,
    },
    /// A message type this bot does not handle.
    Unrecognized {
        /// The message type from the frame metadata.
        message_type: String,
        /// The frame as received.
        raw: String,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    metadata: Metadata,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    message_type: String,
    #[serde(default)]
    subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    session: SessionInfo,
}

#[derive(Debug, Deserialize)]
struct EventPayload<T> {
    event: T,
}

#[derive(Debug, Deserialize)]
struct RevocationPayload {
    subscription: RevokedSubscription,
}

#[derive(Debug, Deserialize)]
struct RevokedSubscription {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    status: String,
}

/// Decode one text frame.
///
/// # Errors
///
/// Returns `CoreError::Parse` when the frame is not JSON, has no
/// `metadata.message_type`, or a recognized type carries a malformed payload.
pub fn decode_frame(text: &str) -> Result<InboundFrame, CoreError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| CoreError::Parse(e.to_string()))?;

    match envelope.metadata.message_type.as_str() {
        "session_welcome" => Ok(InboundFrame::Welcome(payload::<SessionPayload>(envelope.payload)?.session)),
        "session_keepalive" => Ok(InboundFrame::Keepalive),
        "session_reconnect" => Ok(InboundFrame::Reconnect(payload::<SessionPayload>(envelope.payload)?.session)),
        "revocation" => {
            let revoked = payload::<RevocationPayload>(envelope.payload)?.subscription;
            Ok(InboundFrame::Revocation {
                subscription_type: revoked.kind,
                status: revoked.status,
            })
        }
        "notification" => {
            let notification = match envelope.metadata.subscription_type.as_deref() {
                Some(REDEMPTION_ADD) => Notification::RewardRedemption(Box::new(
                    payload::<EventPayload<RedemptionEvent>>(envelope.payload)?.event,
                )),
                other => Notification::Unrecognized {
                    subscription_type: other.unwrap_or_default().to_string(),
                    raw: text.to_string(),
                },
            };
            Ok(InboundFrame::Notification(notification))
        }
        other => Ok(InboundFrame::Unrecognized {
            message_type: other.to_string(),
            raw: text.to_string(),
        }),
    }
}

fn payload<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, CoreError> {
    serde_json::from_value(value).map_err(|e| CoreError::Parse(format!("payload: {e}")))
}
