//! EventSub websocket client.
//!
//! - Frame decoding into typed messages
//! - The session loop with keep-alive deadline and reconnect handling
//! - Reactions to triggered redemptions

pub mod frame;
pub mod reaction;
pub mod session;

pub use frame::{InboundFrame, Notification, RedemptionEvent, Reward, SessionInfo, decode_frame};
pub use reaction::{LogReaction, ReactionHandler, SpeechCommand, reaction_for};
pub use session::{
    Connection, Connector, EventSession, SessionEnd, SessionSettings, SessionState, WsConnector,
};
