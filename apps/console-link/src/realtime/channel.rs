use crate::auth::session::SessionStore;
use crate::realtime::backoff::{ReconnectDecision, ReconnectPolicy, CLOSE_ABNORMAL, CLOSE_NORMAL};
use crate::realtime::error::RealtimeError;
use crate::realtime::listeners::{ListenerHandle, ListenerId, ListenerRegistry};
use crate::realtime::subscriptions::{Subscription, SubscriptionSet};
use crate::realtime::transport::{Connector, Outbound, SocketEvent, SocketLink, TungsteniteConnector};
use realtime_proto::{ClientFrame, ServerFrame};
use serde_json::Value;
use std::fmt;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Sleep};
use tracing::{debug, error, info, trace, warn};
use url::Url;

const TARGET: &str = "console_link::realtime";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    ReconnectScheduled,
    /// Automatic reconnects were used up. Quiescent until the next
    /// [`RealtimeChannel::connect`].
    Exhausted,
}

impl ConnectionState {
    fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Authenticating | ConnectionState::Connected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::ReconnectScheduled => "reconnect-scheduled",
            ConnectionState::Exhausted => "exhausted",
        };
        f.write_str(label)
    }
}

pub struct ChannelOptions {
    pub url: Url,
    pub policy: ReconnectPolicy,
    pub connector: Arc<dyn Connector>,
    /// When set, reconnects authenticate with the store's current access
    /// token instead of the one passed to the last `connect`.
    pub session: Option<Arc<dyn SessionStore>>,
}

impl ChannelOptions {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            policy: ReconnectPolicy::default(),
            connector: Arc::new(TungsteniteConnector),
            session: None,
        }
    }

    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn session(mut self, session: Arc<dyn SessionStore>) -> Self {
        self.session = Some(session);
        self
    }
}

enum Command {
    Connect { token: String },
    Subscribe { id: String, filter: Value },
    Unsubscribe { id: String },
    Disconnect { done: oneshot::Sender<()> },
    Snapshot { reply: oneshot::Sender<Vec<Subscription>> },
}

/// Handle to the realtime channel. Cheap to clone; the connection lives as
/// long as any handle does.
///
/// All connection state is owned by one driver task, which handles commands,
/// socket frames and the reconnect timer one at a time. Listener callbacks
/// for a frame therefore finish before the next frame is read.
#[derive(Clone)]
pub struct RealtimeChannel {
    commands: mpsc::UnboundedSender<Command>,
    listeners: ListenerRegistry,
    state: watch::Receiver<ConnectionState>,
}

impl RealtimeChannel {
    /// Starts the driver task on the current Tokio runtime.
    pub fn spawn(options: ChannelOptions) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let listeners = ListenerRegistry::new();

        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let driver = Driver::new(options, listeners.clone(), state_tx, opened_tx);
        tokio::spawn(driver.run(commands_rx, opened_rx));

        Self {
            commands: commands_tx,
            listeners,
            state: state_rx,
        }
    }

    fn send(&self, command: Command) -> Result<(), RealtimeError> {
        self.commands
            .send(command)
            .map_err(|_| RealtimeError::Shutdown)
    }

    /// Opens the socket and authenticates with `token`. Ignored while a
    /// connection is already being made or is up.
    pub fn connect(&self, token: impl Into<String>) -> Result<(), RealtimeError> {
        self.send(Command::Connect {
            token: token.into(),
        })
    }

    /// Records the subscription and, when connected, sends it right away.
    /// Otherwise it goes out on the next successful connect.
    pub fn subscribe(&self, id: impl Into<String>, filter: Value) -> Result<(), RealtimeError> {
        self.send(Command::Subscribe {
            id: id.into(),
            filter,
        })
    }

    pub fn unsubscribe(&self, id: impl Into<String>) -> Result<(), RealtimeError> {
        self.send(Command::Unsubscribe { id: id.into() })
    }

    pub fn add_listener<F>(&self, id: &str, callback: F) -> ListenerHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listeners.add(id, callback)
    }

    pub fn remove_listener(&self, id: &str, listener: ListenerId) -> bool {
        self.listeners.remove(id, listener)
    }

    /// Cancels any pending reconnect, then closes the socket with 1000.
    /// Subscriptions are kept and replayed on the next `connect`. Resolves
    /// once the driver is quiescent.
    pub async fn disconnect(&self) -> Result<(), RealtimeError> {
        let (done, wait) = oneshot::channel();
        self.send(Command::Disconnect { done })?;
        wait.await.map_err(|_| RealtimeError::Shutdown)
    }

    /// The desired subscriptions, in id order.
    pub async fn subscriptions(&self) -> Result<Vec<Subscription>, RealtimeError> {
        let (reply, wait) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        wait.await.map_err(|_| RealtimeError::Shutdown)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the channel reports `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), RealtimeError> {
        let mut rx = self.state.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| RealtimeError::Shutdown)
    }
}

struct Opened {
    generation: u64,
    result: Result<SocketLink, RealtimeError>,
}

struct Driver {
    url: Url,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    session: Option<Arc<dyn SessionStore>>,
    listeners: ListenerRegistry,
    subscriptions: SubscriptionSet,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    token: Option<String>,
    link: Option<SocketLink>,
    attempts: u32,
    reconnect: Option<Pin<Box<Sleep>>>,
    /// Bumped whenever an in-flight connect attempt becomes irrelevant.
    generation: u64,
    opened_tx: mpsc::UnboundedSender<Opened>,
}

impl Driver {
    fn new(
        options: ChannelOptions,
        listeners: ListenerRegistry,
        state_tx: watch::Sender<ConnectionState>,
        opened_tx: mpsc::UnboundedSender<Opened>,
    ) -> Self {
        Self {
            url: options.url,
            policy: options.policy,
            connector: options.connector,
            session: options.session,
            listeners,
            subscriptions: SubscriptionSet::new(),
            state: ConnectionState::Disconnected,
            state_tx,
            token: None,
            link: None,
            attempts: 0,
            reconnect: None,
            generation: 0,
            opened_tx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut opened_rx: mpsc::UnboundedReceiver<Opened>,
    ) {
        loop {
            // Frames already received are handled before any later command.
            tokio::select! {
                biased;
                event = next_socket_event(&mut self.link) => self.handle_socket_event(event),
                Some(opened) = opened_rx.recv() => self.handle_opened(opened),
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                () = reconnect_due(&mut self.reconnect) => self.handle_reconnect_due(),
            }
        }

        self.shut_down();
        debug!(target: TARGET, "realtime driver stopped");
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(target: TARGET, from = %self.state, to = %next, "connection state changed");
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { token } => self.connect(token),
            Command::Subscribe { id, filter } => {
                let frame = ClientFrame::subscribe(id.clone(), filter.clone());
                self.subscriptions.insert(id, filter);
                if self.state == ConnectionState::Connected {
                    self.send_frame(&frame);
                }
            }
            Command::Unsubscribe { id } => {
                let filter = self.subscriptions.remove(&id);
                self.subscriptions.mark_released(&id);
                if self.state == ConnectionState::Connected {
                    self.send_frame(&ClientFrame::unsubscribe(id, filter.unwrap_or(Value::Null)));
                }
            }
            Command::Disconnect { done } => {
                self.shut_down();
                let _ = done.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.subscriptions.snapshot());
            }
        }
    }

    fn connect(&mut self, token: String) {
        if self.state.is_active() {
            debug!(target: TARGET, state = %self.state, "connect ignored; already active");
            return;
        }
        self.token = Some(token);
        if self.state == ConnectionState::Exhausted {
            self.attempts = 0;
        }
        self.reconnect = None;
        self.open();
    }

    fn open(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.set_state(ConnectionState::Connecting);
        info!(target: TARGET, url = %self.url, attempt = self.attempts, "opening realtime socket");

        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        let opened_tx = self.opened_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = opened_tx.send(Opened { generation, result });
        });
    }

    fn handle_opened(&mut self, opened: Opened) {
        if opened.generation != self.generation || self.state != ConnectionState::Connecting {
            if let Ok(link) = opened.result {
                let _ = link.outbound.send(Outbound::Close { code: CLOSE_NORMAL });
            }
            return;
        }

        match opened.result {
            Ok(link) => {
                self.link = Some(link);
                match self.token.clone() {
                    Some(token) => {
                        self.set_state(ConnectionState::Authenticating);
                        self.send_frame(&ClientFrame::authenticate(token));
                    }
                    None => {
                        warn!(target: TARGET, "socket opened without a token; closing");
                        self.close_link(CLOSE_NORMAL);
                        self.set_state(ConnectionState::Disconnected);
                    }
                }
            }
            Err(err) => {
                warn!(target: TARGET, error = %err, "failed to open realtime socket");
                self.handle_close(CLOSE_ABNORMAL);
            }
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Text(text) => self.handle_frame(&text),
            SocketEvent::Closed { code } => {
                self.link = None;
                self.handle_close(code);
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: TARGET, error = %err, "dropping malformed realtime frame");
                return;
            }
        };

        match frame {
            ServerFrame::Connected { user_id } => {
                if self.state != ConnectionState::Authenticating {
                    debug!(target: TARGET, state = %self.state, "ignoring unexpected connected frame");
                    return;
                }
                self.set_state(ConnectionState::Connected);
                self.attempts = 0;
                let replay = self.subscriptions.replay_frames();
                for frame in &replay {
                    self.send_frame(frame);
                }
                info!(
                    target: TARGET,
                    user_id = ?user_id,
                    replayed = replay.len(),
                    "realtime channel connected"
                );
            }
            ServerFrame::Subscribed { subscription_id } => {
                self.subscriptions.mark_acknowledged(&subscription_id);
                debug!(target: TARGET, %subscription_id, "subscription confirmed");
            }
            ServerFrame::Unsubscribed { subscription_id } => {
                self.subscriptions.mark_released(&subscription_id);
                debug!(target: TARGET, %subscription_id, "subscription released");
            }
            ServerFrame::Error { message } => {
                warn!(target: TARGET, %message, "broker reported an error");
            }
            ServerFrame::Event {
                subscription_id,
                kind,
                frame,
            } => {
                let delivered = self.listeners.dispatch(&subscription_id, &frame);
                trace!(
                    target: TARGET,
                    %subscription_id,
                    kind = kind.as_deref().unwrap_or("message"),
                    delivered,
                    "dispatched realtime message"
                );
            }
            ServerFrame::Unrouted { kind } => {
                debug!(target: TARGET, kind = ?kind, "ignoring frame without subscription id");
            }
        }
    }

    fn handle_close(&mut self, code: u16) {
        self.subscriptions.reset_acknowledged();
        self.set_state(ConnectionState::Disconnected);

        match self.policy.on_close(code, self.attempts) {
            ReconnectDecision::Stay => {
                info!(target: TARGET, code, "realtime socket closed normally");
            }
            ReconnectDecision::Retry { delay, attempts } => {
                self.attempts = attempts;
                self.schedule_reconnect(delay);
                info!(
                    target: TARGET,
                    code,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "realtime socket closed; reconnect scheduled"
                );
            }
            ReconnectDecision::Exhausted { attempts } => {
                self.attempts = attempts;
                self.set_state(ConnectionState::Exhausted);
                error!(
                    target: TARGET,
                    code,
                    attempts,
                    "realtime reconnect attempts exhausted; waiting for an explicit connect"
                );
            }
        }
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        self.reconnect = Some(Box::pin(sleep(delay)));
        self.set_state(ConnectionState::ReconnectScheduled);
    }

    fn handle_reconnect_due(&mut self) {
        self.reconnect = None;
        // A configured store is authoritative: once it is cleared the cached
        // token is purged too.
        let token = match &self.session {
            Some(session) => session.access_token(),
            None => self.token.clone(),
        };
        match token {
            Some(token) => {
                self.token = Some(token);
                self.open();
            }
            None => {
                warn!(target: TARGET, "no access token available; reconnect abandoned");
                self.token = None;
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn send_frame(&mut self, frame: &ClientFrame) {
        let Some(link) = &self.link else {
            return;
        };
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(err) => {
                error!(target: TARGET, error = %err, "failed to encode realtime frame");
                return;
            }
        };
        if link.outbound.send(Outbound::Text(text)).is_err() {
            // The pump is gone; its close event is already queued.
            debug!(target: TARGET, "realtime socket no longer writable");
        }
    }

    fn close_link(&mut self, code: u16) {
        if let Some(link) = self.link.take() {
            let _ = link.outbound.send(Outbound::Close { code });
        }
    }

    /// Intentional shutdown: the timer goes first so nothing can reopen the
    /// socket afterwards.
    fn shut_down(&mut self) {
        self.reconnect = None;
        self.generation = self.generation.wrapping_add(1);
        self.close_link(CLOSE_NORMAL);
        self.subscriptions.reset_acknowledged();
        self.attempts = 0;
        self.token = None;
        self.set_state(ConnectionState::Disconnected);
    }
}

async fn next_socket_event(link: &mut Option<SocketLink>) -> SocketEvent {
    match link {
        Some(link) => link
            .inbound
            .recv()
            .await
            .unwrap_or(SocketEvent::Closed {
                code: CLOSE_ABNORMAL,
            }),
        None => pending().await,
    }
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::mock::{mock_broker, MockBroker, MockSocket};
    use parking_lot::Mutex;
    use serde_json::json;

    fn channel() -> (RealtimeChannel, MockBroker) {
        let (connector, broker) = mock_broker();
        let url = Url::parse("ws://console.test/ws").unwrap();
        let channel = RealtimeChannel::spawn(ChannelOptions::new(url).connector(connector));
        (channel, broker)
    }

    async fn handshake(broker: &mut MockBroker) -> MockSocket {
        let mut socket = broker.accept().await.expect("connection");
        assert_eq!(
            socket.recv_frame().await,
            Some(ClientFrame::authenticate("token-1"))
        );
        socket.acknowledge("user-1");
        socket
    }

    #[tokio::test]
    async fn subscriptions_made_offline_are_sent_after_authentication() {
        let (channel, mut broker) = channel();
        channel.subscribe("tables_changes", json!({"schema": "public"})).unwrap();
        channel.connect("token-1").unwrap();

        let mut socket = handshake(&mut broker).await;
        assert_eq!(
            socket.recv_frame().await,
            Some(ClientFrame::subscribe("tables_changes", json!({"schema": "public"})))
        );
        channel.wait_for_state(ConnectionState::Connected).await.unwrap();
    }

    #[tokio::test]
    async fn connect_is_ignored_while_active() {
        let (channel, mut broker) = channel();
        channel.connect("token-1").unwrap();
        channel.connect("token-1").unwrap();
        let _socket = handshake(&mut broker).await;
        channel.wait_for_state(ConnectionState::Connected).await.unwrap();
        channel.connect("token-1").unwrap();
        channel.subscriptions().await.unwrap();
        assert_eq!(broker.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ignored_connect_leaves_the_reconnect_token_alone() {
        let (channel, mut broker) = channel();
        channel.connect("token-1").unwrap();
        let socket = handshake(&mut broker).await;
        channel.wait_for_state(ConnectionState::Connected).await.unwrap();

        channel.connect("token-late").unwrap();
        socket.close(CLOSE_ABNORMAL);
        let _socket = handshake(&mut broker).await;
        assert_eq!(broker.attempts(), 2);
    }

    #[tokio::test]
    async fn malformed_frames_do_not_disturb_the_connection() {
        let (channel, mut broker) = channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _listener = channel.add_listener("a", move |frame| sink.lock().push(frame.clone()));

        channel.subscribe("a", Value::Null).unwrap();
        channel.connect("token-1").unwrap();
        let mut socket = handshake(&mut broker).await;
        assert!(socket.recv_frame().await.is_some());

        socket.send_text("{definitely not json");
        socket.send_text("42");
        socket.send_json(&json!({"type": "database_change", "subscription_id": "a", "data": 1}));
        channel.subscriptions().await.unwrap();

        assert_eq!(channel.state(), ConnectionState::Connected);
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_while_connected_is_sent_immediately() {
        let (channel, mut broker) = channel();
        channel.connect("token-1").unwrap();
        let mut socket = handshake(&mut broker).await;
        channel.wait_for_state(ConnectionState::Connected).await.unwrap();

        channel.subscribe("a", json!({"x": 1})).unwrap();
        channel.unsubscribe("a").unwrap();
        assert_eq!(
            socket.recv_frame().await,
            Some(ClientFrame::subscribe("a", json!({"x": 1})))
        );
        assert_eq!(
            socket.recv_frame().await,
            Some(ClientFrame::unsubscribe("a", json!({"x": 1})))
        );
        assert!(channel.subscriptions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_closes_normally_and_keeps_intent() {
        let (channel, mut broker) = channel();
        channel.subscribe("a", Value::Null).unwrap();
        channel.connect("token-1").unwrap();
        let mut socket = handshake(&mut broker).await;
        assert!(socket.recv_frame().await.is_some());

        channel.disconnect().await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(
            socket.recv_outbound().await,
            Some(Outbound::Close { code: CLOSE_NORMAL })
        );
        assert_eq!(channel.subscriptions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn broker_initiated_normal_close_is_not_retried() {
        let (channel, mut broker) = channel();
        channel.connect("token-1").unwrap();
        let socket = handshake(&mut broker).await;
        channel.wait_for_state(ConnectionState::Connected).await.unwrap();

        socket.close(CLOSE_NORMAL);
        channel.wait_for_state(ConnectionState::Disconnected).await.unwrap();
        channel.subscriptions().await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(broker.attempts(), 1);
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_driver() {
        let (channel, mut broker) = channel();
        channel.connect("token-1").unwrap();
        let mut socket = handshake(&mut broker).await;
        drop(channel);
        assert_eq!(
            socket.recv_outbound().await,
            Some(Outbound::Close { code: CLOSE_NORMAL })
        );
    }
}
