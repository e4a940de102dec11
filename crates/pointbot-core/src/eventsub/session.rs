//! EventSub websocket session lifecycle.
//!
//! One session owns the live connection, the idle deadline and the
//! subscription for the current session ID. The reader task of each
//! connection is the only producer of frames; the session loop is the only
//! consumer and dispatches strictly in arrival order.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, IdleTimeoutPolicy};
use crate::eventsub::frame::{InboundFrame, Notification, decode_frame};
use crate::eventsub::reaction::ReactionHandler;
use crate::platform::client::EventSubRegistrar;
use crate::CoreError;

/// Frames buffered between a reader task and the session loop.
const FRAME_BUFFER: usize = 1;

/// How long a reader task gets to send its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opening the websocket.
    Connecting,
    /// Connected, waiting for `session_welcome`.
    AwaitingWelcome,
    /// Subscribed and dispatching notifications.
    Receiving,
    /// Moving to the URL from a `session_reconnect` frame.
    Reconnecting,
    /// Finished.
    Closed,
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The shutdown token was cancelled.
    Interrupted,
    /// No frame arrived before the idle deadline.
    IdleTimeout,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => write!(f, "interrupted"),
            Self::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

/// An open connection: decoded frames plus the handle that closes it.
///
/// `close` waits for the producer to finish its closing handshake.
/// Dropping the connection only signals the producer.
#[derive(Debug)]
pub struct Connection {
    frames: mpsc::Receiver<InboundFrame>,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    /// Wrap a frame receiver and the token that stops its producer.
    #[must_use]
    pub const fn new(frames: mpsc::Receiver<InboundFrame>, cancel: CancellationToken) -> Self {
        Self {
            frames,
            cancel,
            reader: None,
        }
    }

    /// Attach the producer task so `close` can wait for it.
    #[must_use]
    pub fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Next frame, or `None` once the peer has closed the connection.
    pub async fn recv(&mut self) -> Option<InboundFrame> {
        self.frames.recv().await
    }

    /// Stop the producer and wait, up to a short grace period, until it has
    /// closed the transport.
    pub async fn close(mut self) {
        self.cancel.cancel();
        let Some(mut reader) = self.reader.take() else {
            return;
        };

        match timeout(CLOSE_GRACE, &mut reader).await {
            Ok(Ok(())) => log::debug!("connection closed"),
            Ok(Err(e)) => log::warn!("connection reader failed: {e}"),
            Err(_) => {
                log::warn!("connection did not close within {CLOSE_GRACE:?}, aborting");
                reader.abort();
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens connections to an EventSub endpoint.
#[async_trait]
pub trait Connector: fmt::Debug + Send + Sync {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Transport` if the connection cannot be opened.
    async fn connect(&self, url: &str) -> Result<Connection, CoreError>;
}

/// Websocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection, CoreError> {
        log::info!("connecting to {url}");
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| CoreError::Transport(format!("connecting to {url}: {e}")))?;

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(pump_frames(stream, tx, cancel.clone()));
        Ok(Connection::new(rx, cancel).with_reader(reader))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn pump_frames(mut stream: WsStream, frames: mpsc::Sender<InboundFrame>, cancel: CancellationToken) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        let text = match message {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(frame))) => {
                log::info!("server closed the websocket: {frame:?}");
                return;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                log::warn!("websocket read failed: {e}");
                return;
            }
            None => {
                log::info!("websocket stream ended");
                return;
            }
        };

        let frame = match decode_frame(&text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("dropping frame: {e}");
                continue;
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            sent = frames.send(frame) => if sent.is_err() {
                break;
            },
        }
    }

    let close = CloseFrame {
        code: CloseCode::Normal,
        reason: "session closed".into(),
    };
    if let Err(e) = stream.close(Some(close)).await {
        log::debug!("closing websocket: {e}");
    }
}

/// Timing and dispatch settings for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Endpoint for fresh connections.
    pub websocket_url: String,
    /// Idle deadline until the first welcome.
    pub initial_keepalive: Duration,
    /// Added to the server keep-alive timeout.
    pub keepalive_margin: Duration,
    /// What to do when the deadline passes or the peer hangs up.
    pub on_idle_timeout: IdleTimeoutPolicy,
    /// Reward title that triggers the reaction.
    pub trigger_title: String,
}

impl SessionSettings {
    /// Settings from the application configuration.
    #[must_use]
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            websocket_url: cfg.eventsub.websocket_url.clone(),
            initial_keepalive: cfg.eventsub.initial_keepalive(),
            keepalive_margin: cfg.eventsub.keepalive_margin(),
            on_idle_timeout: cfg.eventsub.on_idle_timeout,
            trigger_title: cfg.reactions.trigger_title.clone(),
        }
    }
}

enum Event {
    Shutdown,
    Frame(InboundFrame),
    Closed,
    PreviousFrame(InboundFrame),
    PreviousClosed,
    Idle,
}

enum Flow {
    Continue,
    Welcomed,
    Reconnect(String),
}

/// A running EventSub session for one broadcaster.
#[derive(Debug)]
pub struct EventSession {
    settings: SessionSettings,
    broadcaster_user_id: String,
    connector: Box<dyn Connector>,
    registrar: Arc<dyn EventSubRegistrar>,
    reaction: Box<dyn ReactionHandler>,
    state: SessionState,
    session_id: Option<String>,
    idle_timeout: Duration,
}

impl EventSession {
    /// Create a session that subscribes on behalf of `broadcaster_user_id`.
    #[must_use]
    pub fn new(
        settings: SessionSettings,
        broadcaster_user_id: impl Into<String>,
        connector: Box<dyn Connector>,
        registrar: Arc<dyn EventSubRegistrar>,
        reaction: Box<dyn ReactionHandler>,
    ) -> Self {
        let idle_timeout = settings.initial_keepalive;
        Self {
            settings,
            broadcaster_user_id: broadcaster_user_id.into(),
            connector,
            registrar,
            reaction,
            state: SessionState::Connecting,
            session_id: None,
            idle_timeout,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Current idle deadline length.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// ID of the most recently welcomed session.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Run until `shutdown` is cancelled, the idle policy ends the session,
    /// or a fatal error occurs.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting fails, the subscription is rejected,
    /// or the peer closes the connection under the `exit` policy.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> Result<SessionEnd, CoreError> {
        let outcome = self.drive(shutdown).await;
        self.state = SessionState::Closed;
        if let Ok(end) = &outcome {
            log::info!("session ended: {end}");
        }
        outcome
    }

    async fn drive(&mut self, shutdown: &CancellationToken) -> Result<SessionEnd, CoreError> {
        let mut links = Links::default();
        let outcome = self.pump(shutdown, &mut links).await;
        links.close().await;
        outcome
    }

    async fn pump(&mut self, shutdown: &CancellationToken, links: &mut Links) -> Result<SessionEnd, CoreError> {
        links.current = Some(self.connect_fresh().await?);
        let mut deadline = Instant::now() + self.idle_timeout;

        loop {
            let event = tokio::select! {
                biased;
                () = shutdown.cancelled() => Event::Shutdown,
                frame = recv_from(&mut links.current) => frame.map_or(Event::Closed, Event::Frame),
                frame = recv_from(&mut links.previous), if links.previous.is_some() => {
                    frame.map_or(Event::PreviousClosed, Event::PreviousFrame)
                }
                () = sleep_until(deadline) => Event::Idle,
            };

            match event {
                Event::Shutdown => {
                    log::info!("shutdown requested, closing connection");
                    return Ok(SessionEnd::Interrupted);
                }
                Event::Frame(frame) => {
                    match self.handle_frame(frame, shutdown).await? {
                        Flow::Continue => {}
                        Flow::Welcomed => {
                            if let Some(old) = links.previous.take() {
                                log::info!("new session established, closing previous connection");
                                old.close().await;
                            }
                        }
                        Flow::Reconnect(url) => {
                            self.state = SessionState::Reconnecting;
                            let fresh = self.connector.connect(&url).await?;
                            let old = links.current.replace(fresh);
                            if let Some(older) = std::mem::replace(&mut links.previous, old) {
                                older.close().await;
                            }
                        }
                    }
                    deadline = Instant::now() + self.idle_timeout;
                }
                Event::PreviousFrame(frame) => {
                    match frame {
                        InboundFrame::Notification(notification) => {
                            self.dispatch(notification, shutdown).await;
                        }
                        other => log::debug!("ignoring {other:?} from previous connection"),
                    }
                    deadline = Instant::now() + self.idle_timeout;
                }
                Event::PreviousClosed => {
                    if let Some(old) = links.previous.take() {
                        old.close().await;
                    }
                }
                Event::Idle | Event::Closed => {
                    let idle = matches!(event, Event::Idle);
                    match self.settings.on_idle_timeout {
                        IdleTimeoutPolicy::Exit if idle => {
                            log::info!("no frame within {:?}, ending session", self.idle_timeout);
                            return Ok(SessionEnd::IdleTimeout);
                        }
                        IdleTimeoutPolicy::Exit => {
                            return Err(CoreError::Transport("connection closed by peer".to_string()));
                        }
                        IdleTimeoutPolicy::Reconnect => {
                            if idle {
                                log::warn!("no frame within {:?}, reconnecting", self.idle_timeout);
                            } else {
                                log::warn!("connection closed by peer, reconnecting");
                            }
                            links.close().await;
                            links.current = Some(self.connect_fresh().await?);
                            deadline = Instant::now() + self.idle_timeout;
                        }
                    }
                }
            }
        }
    }

    async fn connect_fresh(&mut self) -> Result<Connection, CoreError> {
        self.state = SessionState::Connecting;
        let connection = self.connector.connect(&self.settings.websocket_url).await?;
        self.state = SessionState::AwaitingWelcome;
        self.idle_timeout = self.settings.initial_keepalive;
        Ok(connection)
    }

    async fn handle_frame(&mut self, frame: InboundFrame, shutdown: &CancellationToken) -> Result<Flow, CoreError> {
        match frame {
            InboundFrame::Welcome(session) => {
                let keepalive = session
                    .keepalive_timeout_seconds
                    .map_or(self.settings.initial_keepalive, Duration::from_secs);
                self.idle_timeout = keepalive + self.settings.keepalive_margin;
                log::info!(
                    "session {} welcomed, idle timeout {:?}",
                    session.id,
                    self.idle_timeout
                );

                self.registrar
                    .subscribe(&self.broadcaster_user_id, &session.id)
                    .await?;
                self.session_id = Some(session.id);
                self.state = SessionState::Receiving;
                Ok(Flow::Welcomed)
            }
            InboundFrame::Notification(notification) => {
                self.dispatch(notification, shutdown).await;
                Ok(Flow::Continue)
            }
            InboundFrame::Keepalive => {
                log::trace!("keepalive");
                Ok(Flow::Continue)
            }
            InboundFrame::Reconnect(session) => {
                if let Some(url) = session.reconnect_url {
                    log::info!("server requested reconnect to {url}");
                    Ok(Flow::Reconnect(url))
                } else {
                    log::warn!("reconnect frame without a URL, staying on the current connection");
                    Ok(Flow::Continue)
                }
            }
            InboundFrame::Revocation {
                subscription_type,
                status,
            } => {
                log::warn!("subscription {subscription_type} revoked: {status}");
                Ok(Flow::Continue)
            }
            InboundFrame::Unrecognized { message_type, raw } => {
                log::warn!("ignoring unrecognized message type '{message_type}'");
                log::debug!("{raw}");
                Ok(Flow::Continue)
            }
        }
    }

    // Shutdown abandons a running reaction.
    async fn dispatch(&self, notification: Notification, shutdown: &CancellationToken) {
        match notification {
            Notification::RewardRedemption(event) if event.reward.title == self.settings.trigger_title => {
                log::info!(
                    "{} redeemed '{}': {}",
                    event.user_name,
                    event.reward.title,
                    event.user_input
                );
                tokio::select! {
                    () = shutdown.cancelled() => log::warn!("shutdown during reaction, abandoning it"),
                    reacted = self.reaction.react(&event.user_input) => {
                        if let Err(e) = reacted {
                            log::error!("reaction failed: {e}");
                        }
                    }
                }
            }
            Notification::RewardRedemption(event) => {
                log::info!("{} redeemed '{}'", event.user_name, event.reward.title);
            }
            Notification::Unrecognized {
                subscription_type,
                raw,
            } => {
                log::info!("ignoring notification for {subscription_type}");
                log::debug!("{raw}");
            }
        }
    }
}

/// The live connection and, during a reconnect, the one it replaces.
#[derive(Debug, Default)]
struct Links {
    current: Option<Connection>,
    previous: Option<Connection>,
}

impl Links {
    async fn close(&mut self) {
        if let Some(previous) = self.previous.take() {
            previous.close().await;
        }
        if let Some(current) = self.current.take() {
            current.close().await;
        }
    }
}

async fn recv_from(slot: &mut Option<Connection>) -> Option<InboundFrame> {
    match slot {
        Some(connection) => connection.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventsub::frame::{RedemptionEvent, Reward, SessionInfo};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    struct FakeConnector {
        pending: Mutex<VecDeque<Connection>>,
        urls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, url: &str) -> Result<Connection, CoreError> {
            self.urls.lock().unwrap().push(url.to_string());
            self.pending
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| CoreError::Transport("no more connections".to_string()))
        }
    }

    #[derive(Debug, Default)]
    struct FakeRegistrar {
        calls: Mutex<Vec<(String, String)>>,
        reject: bool,
    }

    #[async_trait]
    impl EventSubRegistrar for FakeRegistrar {
        async fn subscribe(&self, broadcaster_user_id: &str, session_id: &str) -> Result<(), CoreError> {
            self.calls
                .lock()
                .unwrap()
                .push((broadcaster_user_id.to_string(), session_id.to_string()));
            if self.reject {
                Err(CoreError::Subscription {
                    status: 403,
                    body: "missing scope".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    impl FakeRegistrar {
        fn sessions(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
        }
    }

    #[derive(Debug, Default)]
    struct RecordingReaction {
        texts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ReactionHandler for RecordingReaction {
        async fn react(&self, text: &str) -> Result<(), CoreError> {
            self.texts.lock().unwrap().push(text.to_string());
            if text == "explode" {
                return Err(CoreError::Other("speech failed".to_string()));
            }
            Ok(())
        }
    }

    /// Never finishes, like a speech program that hangs.
    #[derive(Debug, Default)]
    struct StuckReaction {
        started: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ReactionHandler for StuckReaction {
        async fn react(&self, _text: &str) -> Result<(), CoreError> {
            self.started.store(true, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    /// Test side of a fake connection.
    struct Link {
        tx: mpsc::Sender<InboundFrame>,
        cancel: CancellationToken,
    }

    fn link() -> (Link, Connection) {
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let cancel = CancellationToken::new();
        (
            Link {
                tx,
                cancel: cancel.clone(),
            },
            Connection::new(rx, cancel),
        )
    }

    fn feed(tx: &mpsc::Sender<InboundFrame>, frames: Vec<InboundFrame>) {
        let tx = tx.clone();
        tokio::spawn(async move {
            for frame in frames {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
    }

    fn welcome(id: &str, keepalive: u64) -> InboundFrame {
        InboundFrame::Welcome(SessionInfo {
            id: id.to_string(),
            status: "connected".to_string(),
            connected_at: "2024-01-01T00:00:00Z".to_string(),
            keepalive_timeout_seconds: Some(keepalive),
            reconnect_url: None,
        })
    }

    fn reconnect(url: &str) -> InboundFrame {
        InboundFrame::Reconnect(SessionInfo {
            id: "S1".to_string(),
            status: "reconnecting".to_string(),
            connected_at: String::new(),
            keepalive_timeout_seconds: None,
            reconnect_url: Some(url.to_string()),
        })
    }

    fn redemption(title: &str, input: &str) -> InboundFrame {
        InboundFrame::Notification(Notification::RewardRedemption(Box::new(RedemptionEvent {
            id: "r1".to_string(),
            user_login: "viewer".to_string(),
            user_name: "Viewer".to_string(),
            user_input: input.to_string(),
            reward: Reward {
                id: "w1".to_string(),
                title: title.to_string(),
                cost: 100,
                prompt: String::new(),
            },
            broadcaster_user_login: "streamer".to_string(),
        })))
    }

    fn settings(policy: IdleTimeoutPolicy) -> SessionSettings {
        SessionSettings {
            websocket_url: "wss://eventsub.example.test/ws".to_string(),
            initial_keepalive: Duration::from_secs(30),
            keepalive_margin: Duration::from_secs(2),
            on_idle_timeout: policy,
            trigger_title: "TTS".to_string(),
        }
    }

    struct Harness {
        session: EventSession,
        registrar: Arc<FakeRegistrar>,
        texts: Arc<Mutex<Vec<String>>>,
        urls: Arc<Mutex<Vec<String>>>,
    }

    fn harness(policy: IdleTimeoutPolicy, connections: Vec<Connection>, registrar: FakeRegistrar) -> Harness {
        let connector = FakeConnector {
            pending: Mutex::new(connections.into()),
            ..FakeConnector::default()
        };
        let urls = connector.urls.clone();
        let reaction = RecordingReaction::default();
        let texts = reaction.texts.clone();
        let registrar = Arc::new(registrar);
        let session = EventSession::new(
            settings(policy),
            "42",
            Box::new(connector),
            registrar.clone(),
            Box::new(reaction),
        );
        Harness {
            session,
            registrar,
            texts,
            urls,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn welcome_subscribes_once_and_sets_idle_timeout() {
        let (link, conn) = link();
        let mut h = harness(IdleTimeoutPolicy::Exit, vec![conn], FakeRegistrar::default());
        feed(&link.tx, vec![welcome("S1", 10), InboundFrame::Keepalive]);

        let start = Instant::now();
        let end = h.session.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(end, SessionEnd::IdleTimeout);
        assert_eq!(h.session.idle_timeout(), Duration::from_secs(12));
        assert_eq!(h.session.session_id(), Some("S1"));
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(*h.registrar.calls.lock().unwrap(), vec![("42".to_string(), "S1".to_string())]);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(12) && elapsed < Duration::from_secs(13));
        assert!(link.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn no_welcome_times_out_on_initial_deadline() {
        let (link, conn) = link();
        let mut h = harness(IdleTimeoutPolicy::Exit, vec![conn], FakeRegistrar::default());

        let start = Instant::now();
        let end = h.session.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(end, SessionEnd::IdleTimeout);
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(h.registrar.sessions().is_empty());
        drop(link);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_title_reaches_reaction() {
        let (link, conn) = link();
        let mut h = harness(IdleTimeoutPolicy::Exit, vec![conn], FakeRegistrar::default());
        feed(
            &link.tx,
            vec![
                welcome("S1", 10),
                redemption("TTS", "hello"),
                redemption("Other", "nope"),
                redemption("TTS", "explode"),
                redemption("TTS", "still here"),
            ],
        );

        let end = h.session.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(end, SessionEnd::IdleTimeout);
        assert_eq!(*h.texts.lock().unwrap(), vec!["hello", "explode", "still here"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_frames_do_not_stop_the_session() {
        let (link, conn) = link();
        let mut h = harness(IdleTimeoutPolicy::Exit, vec![conn], FakeRegistrar::default());
        feed(
            &link.tx,
            vec![
                InboundFrame::Unrecognized {
                    message_type: "session_party".to_string(),
                    raw: "{}".to_string(),
                },
                InboundFrame::Notification(Notification::Unrecognized {
                    subscription_type: "channel.follow".to_string(),
                    raw: "{}".to_string(),
                }),
                InboundFrame::Revocation {
                    subscription_type: "channel.follow".to_string(),
                    status: "user_removed".to_string(),
                },
                welcome("S1", 10),
                redemption("TTS", "hi"),
            ],
        );

        h.session.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(h.registrar.sessions(), vec!["S1"]);
        assert_eq!(*h.texts.lock().unwrap(), vec!["hi"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_subscription_is_fatal() {
        let (link, conn) = link();
        let registrar = FakeRegistrar {
            reject: true,
            ..FakeRegistrar::default()
        };
        let mut h = harness(IdleTimeoutPolicy::Exit, vec![conn], registrar);
        feed(&link.tx, vec![welcome("S1", 10)]);

        let err = h.session.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, CoreError::Subscription { status: 403, .. }));
        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(link.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_frame_resubscribes_then_closes_old_connection() {
        let (first, conn1) = link();
        let (second, conn2) = link();
        let mut h = harness(IdleTimeoutPolicy::Exit, vec![conn1, conn2], FakeRegistrar::default());
        feed(&first.tx, vec![welcome("S1", 10), reconnect("wss://eventsub.example.test/ws?id=2")]);
        feed(&second.tx, vec![welcome("S2", 10)]);

        let end = h.session.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(end, SessionEnd::IdleTimeout);
        assert_eq!(h.registrar.sessions(), vec!["S1", "S2"]);
        assert_eq!(
            *h.urls.lock().unwrap(),
            vec!["wss://eventsub.example.test/ws", "wss://eventsub.example.test/ws?id=2"]
        );
        assert_eq!(h.session.session_id(), Some("S2"));
        assert!(first.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn old_connection_notifications_are_dispatched_until_welcome() {
        let (first, conn1) = link();
        let (second, conn2) = link();
        let mut h = harness(IdleTimeoutPolicy::Exit, vec![conn1, conn2], FakeRegistrar::default());
        feed(
            &first.tx,
            vec![
                welcome("S1", 10),
                reconnect("wss://eventsub.example.test/ws?id=2"),
                redemption("TTS", "late"),
            ],
        );

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let texts = h.texts.clone();
        let second_tx = second.tx.clone();
        tokio::spawn(async move {
            while texts.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            second_tx.send(welcome("S2", 10)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let end = h.session.run(&shutdown).await.unwrap();

        assert_eq!(end, SessionEnd::Interrupted);
        assert_eq!(*h.texts.lock().unwrap(), vec!["late"]);
        assert_eq!(h.registrar.sessions(), vec!["S1", "S2"]);
        assert!(first.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_is_an_error_under_exit_policy() {
        let (link, conn) = link();
        let mut h = harness(IdleTimeoutPolicy::Exit, vec![conn], FakeRegistrar::default());
        feed(&link.tx, vec![welcome("S1", 10)]);
        drop(link.tx);

        let err = h.session.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_policy_opens_fresh_connection() {
        let (first, conn1) = link();
        let (second, conn2) = link();
        let mut h = harness(IdleTimeoutPolicy::Reconnect, vec![conn1, conn2], FakeRegistrar::default());
        feed(&first.tx, vec![welcome("S1", 10)]);
        drop(first.tx);
        feed(&second.tx, vec![welcome("S2", 10)]);

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let registrar = h.registrar.clone();
        tokio::spawn(async move {
            while registrar.sessions().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            trigger.cancel();
        });

        let end = h.session.run(&shutdown).await.unwrap();

        assert_eq!(end, SessionEnd::Interrupted);
        assert_eq!(h.registrar.sessions(), vec!["S1", "S2"]);
        assert_eq!(h.urls.lock().unwrap().len(), 2);
        assert!(second.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_policy_recovers_from_idle() {
        let (first, conn1) = link();
        let (second, conn2) = link();
        let mut h = harness(IdleTimeoutPolicy::Reconnect, vec![conn1, conn2], FakeRegistrar::default());
        feed(&first.tx, vec![welcome("S1", 10)]);
        feed(&second.tx, vec![welcome("S2", 10)]);

        // The third connection attempt has nothing to return.
        let err = h.session.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, CoreError::Transport(msg) if msg.contains("no more connections")));
        assert_eq!(h.registrar.sessions(), vec!["S1", "S2"]);
        assert!(first.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_closes_connection() {
        let (link, conn) = link();
        let mut h = harness(IdleTimeoutPolicy::Exit, vec![conn], FakeRegistrar::default());
        feed(&link.tx, vec![welcome("S1", 10)]);

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let registrar = h.registrar.clone();
        tokio::spawn(async move {
            while registrar.sessions().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            trigger.cancel();
        });

        let end = h.session.run(&shutdown).await.unwrap();

        assert_eq!(end, SessionEnd::Interrupted);
        assert!(link.cancel.is_cancelled());
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn ws_connector_decodes_frames_and_closes_normally() {
        use futures_util::SinkExt;
        use tokio::net::TcpListener;
        use tokio::sync::oneshot;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let welcome = serde_json::json!({
                "metadata": { "message_type": "session_welcome" },
                "payload": { "session": { "id": "S1", "keepalive_timeout_seconds": 10 } }
            });
            let keepalive = serde_json::json!({
                "metadata": { "message_type": "session_keepalive" },
                "payload": {}
            });
            ws.send(WsMessage::Text(welcome.to_string().into())).await.unwrap();
            ws.send(WsMessage::Text("garbage".into())).await.unwrap();
            ws.send(WsMessage::Text(keepalive.to_string().into())).await.unwrap();

            while let Some(Ok(message)) = ws.next().await {
                if let WsMessage::Close(frame) = message {
                    let _ = closed_tx.send(frame.map(|f| f.code));
                    break;
                }
            }
        });

        let mut conn = WsConnector.connect(&format!("ws://{addr}")).await.unwrap();
        assert!(matches!(conn.recv().await, Some(InboundFrame::Welcome(s)) if s.id == "S1"));
        assert_eq!(conn.recv().await, Some(InboundFrame::Keepalive));

        conn.close().await;
        assert_eq!(closed_rx.await.unwrap(), Some(CloseCode::Normal));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_abandons_a_stuck_reaction() {
        let (link, conn) = link();
        let reaction = StuckReaction::default();
        let started = reaction.started.clone();
        let connector = FakeConnector {
            pending: Mutex::new(vec![conn].into()),
            ..FakeConnector::default()
        };
        let mut session = EventSession::new(
            settings(IdleTimeoutPolicy::Exit),
            "42",
            Box::new(connector),
            Arc::new(FakeRegistrar::default()),
            Box::new(reaction),
        );
        feed(&link.tx, vec![welcome("S1", 10), redemption("TTS", "never done")]);

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let end = tokio::time::timeout(Duration::from_secs(3), session.run(&shutdown))
            .await
            .expect("run returns after interrupt")
            .unwrap();

        assert_eq!(end, SessionEnd::Interrupted);
        assert!(started.load(Ordering::SeqCst));
        assert!(link.cancel.is_cancelled());
    }

    #[test]
    fn interrupt_sends_close_frame_before_runtime_is_dropped() {
        use futures_util::SinkExt;
        use tokio::net::TcpListener;

        let server_rt = tokio::runtime::Runtime::new().unwrap();
        let listener = server_rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = std::sync::mpsc::channel();

        server_rt.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let welcome = serde_json::json!({
                "metadata": { "message_type": "session_welcome" },
                "payload": { "session": { "id": "S1", "keepalive_timeout_seconds": 10 } }
            });
            ws.send(WsMessage::Text(welcome.to_string().into())).await.unwrap();

            while let Some(Ok(message)) = ws.next().await {
                if let WsMessage::Close(frame) = message {
                    let _ = closed_tx.send(frame.map(|f| f.code));
                    break;
                }
            }
        });

        let registrar = Arc::new(FakeRegistrar::default());
        let mut session = EventSession::new(
            SessionSettings {
                websocket_url: format!("ws://{addr}"),
                ..settings(IdleTimeoutPolicy::Exit)
            },
            "42",
            Box::new(WsConnector),
            registrar.clone(),
            Box::new(RecordingReaction::default()),
        );

        // Same shape as the binary: run to completion, then drop the runtime.
        let rt = tokio::runtime::Runtime::new().unwrap();
        let shutdown = CancellationToken::new();
        let end = rt
            .block_on(async {
                let trigger = shutdown.clone();
                let subscribed = registrar.clone();
                tokio::spawn(async move {
                    while subscribed.sessions().is_empty() {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    trigger.cancel();
                });
                session.run(&shutdown).await
            })
            .unwrap();
        drop(rt);

        assert_eq!(end, SessionEnd::Interrupted);
        assert_eq!(
            closed_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Some(CloseCode::Normal)
        );
    }
}
