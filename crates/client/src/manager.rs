//! Dual-channel connection manager.
//!
//! [`ChatConnectionManager`] is a cheap, cloneable handle. The actual state
//! lives in a single event-loop task that applies every transition for both
//! channels sequentially:
//!
//! - public calls arrive as [`Command`]s,
//! - socket events, credential loads, history results and reconnect timers
//!   arrive as [`Internal`] events.
//!
//! Nothing in the loop awaits I/O. Credential loading, history fetches and
//! reconnect delays run in spawned tasks and report back, carrying the socket
//! id / timer id / path they were started for so stale results can be dropped.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::channel::{
    ChannelId, ChannelSnapshot, ChannelState, ConnectionState, ReconnectTimer, SocketId,
    SocketSlot,
};
use crate::config::ChatConfig;
use crate::infrastructure::storage::CredentialStore;
use crate::infrastructure::urls::socket_url;
use crate::ports::outbound::{
    ApiError, ChatAction, ChatApiPort, ChatStore, ChatTransport, HeaderPair, SocketEvent,
    SocketEventSink, SocketRequest, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};

const REASON_PATH_CLEARED: &str = "path became null";
const REASON_CLIENT_DISCONNECT: &str = "Client initiated disconnect";
const REASON_SHUTDOWN: &str = "Client shutting down";

/// External collaborators of the manager.
#[derive(Clone)]
pub struct ChatDependencies {
    pub transport: Arc<dyn ChatTransport>,
    pub api: Arc<dyn ChatApiPort>,
    pub store: Arc<dyn ChatStore>,
    pub credentials: CredentialStore,
}

enum Command {
    Connect {
        channel: ChannelId,
        path: Option<String>,
    },
    Send {
        path: String,
        message: Value,
        reply: oneshot::Sender<bool>,
    },
    Disconnect,
    Snapshot {
        channel: ChannelId,
        reply: oneshot::Sender<ChannelSnapshot>,
    },
}

enum Internal {
    Socket {
        channel: ChannelId,
        socket: SocketId,
        event: SocketEvent,
    },
    CredentialsLoaded {
        channel: ChannelId,
        socket: SocketId,
        headers: Vec<HeaderPair>,
    },
    ReconnectDue {
        channel: ChannelId,
        timer: u64,
    },
    HistoryLoaded {
        channel: ChannelId,
        fetch: u64,
        path: String,
        result: Result<Vec<Value>, ApiError>,
    },
}

/// Handle to the connection manager.
///
/// Dropping the last handle stops the event loop and closes both sockets.
#[derive(Clone)]
pub struct ChatConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
}

impl ChatConnectionManager {
    /// Start the event loop on the current tokio runtime.
    pub fn spawn(config: ChatConfig, deps: ChatDependencies) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let event_loop = EventLoop {
            config,
            deps,
            channels: ChannelId::ALL
                .into_iter()
                .map(|c| (c, ChannelState::default()))
                .collect(),
            published: HashMap::new(),
            internal_tx,
            next_socket_id: 0,
            next_timer_id: 0,
        };
        tokio::spawn(event_loop.run(command_rx, internal_rx));

        Self { commands }
    }

    /// Point `channel` at `path`. `None` or an empty path disconnects the channel.
    pub fn connect(&self, channel: ChannelId, path: Option<&str>) {
        self.submit(Command::Connect {
            channel,
            path: path.map(str::to_string),
        });
    }

    /// Send `message` on whichever channel currently targets `path`.
    ///
    /// Returns false when no channel targets `path` or its socket is not open.
    pub async fn send_message(&self, path: &str, message: &Value) -> bool {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Send {
            path: path.to_string(),
            message: message.clone(),
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Close both channels and forget their targets.
    pub fn disconnect(&self) {
        self.submit(Command::Disconnect);
    }

    /// Current view of `channel`, or `None` if the event loop is gone.
    pub async fn snapshot(&self, channel: ChannelId) -> Option<ChannelSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Snapshot { channel, reply });
        rx.await.ok()
    }

    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("Chat connection manager is not running");
        }
    }
}

struct EventLoop {
    config: ChatConfig,
    deps: ChatDependencies,
    channels: HashMap<ChannelId, ChannelState>,
    /// Last state reported through `ChatAction::ConnectionChanged`
    published: HashMap<ChannelId, ConnectionState>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    next_socket_id: u64,
    next_timer_id: u64,
}

impl EventLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = internal.recv() => self.handle_internal(event),
            }
            self.publish_states();
        }

        tracing::debug!("Chat connection manager stopping");
        for channel in ChannelId::ALL {
            self.reset_channel(channel, REASON_SHUTDOWN);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { channel, path } => self.connect(channel, path),
            Command::Send {
                path,
                message,
                reply,
            } => {
                let sent = self.send_message(&path, &message);
                let _ = reply.send(sent);
            }
            Command::Disconnect => self.disconnect(),
            Command::Snapshot { channel, reply } => {
                let _ = reply.send(self.channel(channel).snapshot(channel));
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Socket {
                channel,
                socket,
                event,
            } => self.on_socket_event(channel, socket, event),
            Internal::CredentialsLoaded {
                channel,
                socket,
                headers,
            } => self.open_socket(channel, socket, headers),
            Internal::ReconnectDue { channel, timer } => self.on_reconnect_due(channel, timer),
            Internal::HistoryLoaded {
                channel,
                fetch,
                path,
                result,
            } => self.on_history_loaded(channel, fetch, path, result),
        }
    }

    fn channel(&mut self, channel: ChannelId) -> &mut ChannelState {
        self.channels.entry(channel).or_default()
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    fn connect(&mut self, channel: ChannelId, path: Option<String>) {
        let Some(path) = path.filter(|p| !p.is_empty()) else {
            tracing::info!("Disconnecting {} channel: no target path", channel);
            self.reset_channel(channel, REASON_PATH_CLEARED);
            return;
        };

        let state = self.channel(channel);

        if state.targets(&path) && state.socket.is_some() {
            tracing::debug!(
                "{} channel already connected to {}, refreshing history",
                channel,
                path
            );
            self.fetch_messages(channel, Some(&path));
            return;
        }

        if state.is_connecting {
            tracing::debug!(
                "{} channel connection already in progress, ignoring connect to {}",
                channel,
                path
            );
            return;
        }

        tracing::info!("Connecting {} channel to {}", channel, path);
        state.path = Some(path.clone());
        state.close_socket(
            NORMAL_CLOSURE,
            &format!("New {channel} connection requested"),
        );
        state.cancel_reconnect();
        state.reconnect_attempts = 0;

        self.fetch_messages(channel, Some(&path));
        self.begin_attempt(channel, path);
    }

    fn send_message(&mut self, path: &str, message: &Value) -> bool {
        let Some(channel) = ChannelId::ALL
            .into_iter()
            .find(|c| self.channels.get(c).is_some_and(|s| s.targets(path)))
        else {
            tracing::warn!("No chat channel is connected to {}, message dropped", path);
            return false;
        };

        let state = self.channel(channel);
        if let Some(handle) = state
            .socket
            .as_ref()
            .filter(|slot| slot.open)
            .and_then(|slot| slot.handle.as_ref())
        {
            let text = match serde_json::to_string(message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to serialize chat message: {}", e);
                    return false;
                }
            };
            return match handle.send_text(text) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!("Failed to send on {} channel: {}", channel, e);
                    false
                }
            };
        }

        tracing::warn!("{} channel socket is not open, message not sent", channel);
        if !state.is_connecting {
            self.connect(channel, Some(path.to_string()));
        }
        false
    }

    fn disconnect(&mut self) {
        tracing::info!("Disconnecting all chat channels");
        for channel in ChannelId::ALL {
            self.reset_channel(channel, REASON_CLIENT_DISCONNECT);
        }
    }

    /// Back to the initial disconnected state.
    fn reset_channel(&mut self, channel: ChannelId, reason: &str) {
        let state = self.channel(channel);
        state.cancel_reconnect();
        state.path = None;
        state.close_socket(NORMAL_CLOSURE, reason);
        state.is_connecting = false;
        state.reconnect_attempts = 0;
        state.exhausted = false;
    }

    // =========================================================================
    // Connection attempts
    // =========================================================================

    /// Reserve a socket slot and load credentials; the socket is opened once
    /// they arrive.
    fn begin_attempt(&mut self, channel: ChannelId, path: String) {
        self.next_socket_id += 1;
        let id = SocketId(self.next_socket_id);

        let state = self.channel(channel);
        state.is_connecting = true;
        state.exhausted = false;
        state.socket = Some(SocketSlot {
            id,
            path,
            handle: None,
            open: false,
        });

        let credentials = self.deps.credentials.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let headers = credentials.headers_or_empty().await;
            let _ = tx.send(Internal::CredentialsLoaded {
                channel,
                socket: id,
                headers,
            });
        });
    }

    fn open_socket(&mut self, channel: ChannelId, socket: SocketId, headers: Vec<HeaderPair>) {
        let api_base_url = self.config.api_base_url.clone();
        let transport = Arc::clone(&self.deps.transport);
        let tx = self.internal_tx.clone();

        let state = self.channel(channel);
        let Some(slot) = state
            .socket
            .as_mut()
            .filter(|slot| slot.id == socket && slot.handle.is_none())
        else {
            tracing::debug!("{} channel attempt superseded before handshake", channel);
            return;
        };

        let url = match socket_url(&api_base_url, &slot.path) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!("Invalid chat socket URL for {}: {}", slot.path, e);
                self.on_socket_event(channel, socket, SocketEvent::Error(e.to_string()));
                self.on_socket_event(
                    channel,
                    socket,
                    SocketEvent::close(ABNORMAL_CLOSURE, "invalid socket url"),
                );
                return;
            }
        };

        tracing::debug!("Opening {} channel socket: {}", channel, url);
        let sink = SocketEventSink::new(move |event| {
            let _ = tx.send(Internal::Socket {
                channel,
                socket,
                event,
            });
        });
        slot.handle = Some(transport.open(SocketRequest { url, headers }, sink));
    }

    fn on_socket_event(&mut self, channel: ChannelId, socket: SocketId, event: SocketEvent) {
        let state = self.channel(channel);
        let Some(slot) = state.socket.as_mut().filter(|slot| slot.id == socket) else {
            tracing::debug!("Ignoring event from superseded {} socket", channel);
            return;
        };

        match event {
            SocketEvent::Open => {
                tracing::info!("{} channel connected to {}", channel, slot.path);
                slot.open = true;
                state.is_connecting = false;
                state.reconnect_attempts = 0;
            }
            SocketEvent::Message(text) => {
                let arrival_path = slot.path.clone();
                self.on_message(channel, &arrival_path, &text);
            }
            SocketEvent::Error(e) => {
                tracing::error!("{} channel socket error: {}", channel, e);
                state.is_connecting = false;
            }
            SocketEvent::Close { code, reason } => {
                state.is_connecting = false;
                state.socket = None;

                if code == NORMAL_CLOSURE {
                    tracing::info!("{} channel closed normally: {}", channel, reason);
                    return;
                }

                tracing::warn!(
                    "{} channel closed unexpectedly (code {}): {}",
                    channel,
                    code,
                    reason
                );
                let path = state.path.clone();
                self.schedule_reconnect(channel, path);
            }
        }
    }

    fn on_message(&mut self, channel: ChannelId, arrival_path: &str, text: &str) {
        if let Err(e) = serde_json::from_str::<Value>(text) {
            tracing::warn!("Failed to parse {} channel message: {}", channel, e);
            return;
        }

        let current = self.channel(channel).path.clone();
        self.fetch_messages(channel, current.as_deref());

        let read = self.deps.store.displayed_path().as_deref() == Some(arrival_path);
        self.deps
            .store
            .dispatch(ChatAction::SetMessagesRead { channel, read });
    }

    // =========================================================================
    // Reconnection
    // =========================================================================

    fn schedule_reconnect(&mut self, channel: ChannelId, path: Option<String>) {
        let Some(path) = path else {
            return;
        };

        let policy = self.config.reconnect;
        self.next_timer_id += 1;
        let timer_id = self.next_timer_id;
        let tx = self.internal_tx.clone();

        let state = self.channel(channel);
        if !state.targets(&path) {
            tracing::debug!("{} channel moved away from {}, not reconnecting", channel, path);
            return;
        }

        let Some(delay) = policy.delay_for(state.reconnect_attempts) else {
            tracing::warn!(
                "{} channel gave up reconnecting to {} after {} attempts",
                channel,
                path,
                state.reconnect_attempts
            );
            state.exhausted = true;
            return;
        };

        state.cancel_reconnect();
        tracing::info!(
            "Reconnecting {} channel to {} in {}ms (attempt {} of {})",
            channel,
            path,
            delay.as_millis(),
            state.reconnect_attempts + 1,
            policy.max_attempts
        );

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::ReconnectDue {
                channel,
                timer: timer_id,
            });
        });

        state.reconnect_timer = Some(ReconnectTimer {
            id: timer_id,
            path,
            delay,
            task,
        });
    }

    fn on_reconnect_due(&mut self, channel: ChannelId, timer: u64) {
        let state = self.channel(channel);
        let Some(path) = state
            .reconnect_timer
            .as_ref()
            .filter(|t| t.id == timer)
            .map(|t| t.path.clone())
        else {
            tracing::debug!("Ignoring cancelled {} channel reconnect", channel);
            return;
        };
        state.reconnect_timer = None;

        if !state.targets(&path) {
            tracing::debug!("{} channel moved away from {}, reconnect dropped", channel, path);
            return;
        }

        state.reconnect_attempts += 1;
        tracing::info!(
            "{} channel reconnect attempt {} to {}",
            channel,
            state.reconnect_attempts,
            path
        );

        self.fetch_messages(channel, Some(&path));
        self.begin_attempt(channel, path);
    }

    // =========================================================================
    // History
    // =========================================================================

    fn fetch_messages(&mut self, channel: ChannelId, path: Option<&str>) {
        let state = self.channel(channel);
        state.history_fetch += 1;
        let fetch = state.history_fetch;

        let Some(path) = path.filter(|p| !p.is_empty()) else {
            self.deps.store.dispatch(ChatAction::SetLoading {
                channel,
                loading: false,
            });
            return;
        };

        self.deps.store.dispatch(ChatAction::SetLoading {
            channel,
            loading: true,
        });

        let api = Arc::clone(&self.deps.api);
        let limit = self.config.history_limit;
        let tx = self.internal_tx.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            let result = api.fetch_messages(&path, limit).await;
            let _ = tx.send(Internal::HistoryLoaded {
                channel,
                fetch,
                path,
                result,
            });
        });
    }

    fn on_history_loaded(
        &mut self,
        channel: ChannelId,
        fetch: u64,
        path: String,
        result: Result<Vec<Value>, ApiError>,
    ) {
        if self.channel(channel).history_fetch != fetch {
            tracing::debug!(
                "Discarding superseded {} channel history fetch for {}",
                channel,
                path
            );
            return;
        }

        match result {
            Ok(messages) if self.channel(channel).targets(&path) => {
                self.deps
                    .store
                    .dispatch(ChatAction::ReplaceMessages { channel, messages });
            }
            Ok(_) => {
                tracing::debug!("Discarding {} channel history for stale path {}", channel, path);
            }
            Err(e) => {
                tracing::warn!("Failed to fetch {} channel history for {}: {}", channel, path, e);
            }
        }

        self.deps.store.dispatch(ChatAction::SetLoading {
            channel,
            loading: false,
        });
    }

    fn publish_states(&mut self) {
        for channel in ChannelId::ALL {
            let state = self.channel(channel).state();
            if self.published.get(&channel) != Some(&state) {
                self.published.insert(channel, state);
                self.deps
                    .store
                    .dispatch(ChatAction::ConnectionChanged { channel, state });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::infrastructure::storage::MemoryKeyValueStore;
    use crate::ports::outbound::MockChatStore;
    use crate::testing::{FakeSocket, FakeTransport, Harness, StubChatApi};

    const GAME_PATH: &str = "games/42";
    const GANG_PATH: &str = "gangs/7";

    /// Let every spawned task run, then move the clock by 1ms.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn harness() -> Harness {
        Harness::start(ChatConfig::default())
    }

    async fn snapshot(h: &Harness, channel: ChannelId) -> ChannelSnapshot {
        h.manager.snapshot(channel).await.expect("manager running")
    }

    async fn connected(h: &Harness, channel: ChannelId, path: &str) -> FakeSocket {
        h.manager.connect(channel, Some(path));
        settle().await;
        let socket = h.transport.last().expect("socket opened");
        socket.accept();
        settle().await;
        socket
    }

    #[tokio::test(start_paused = true)]
    async fn connect_opens_socket_and_loads_history() {
        let h = harness();
        h.api.respond_with(GAME_PATH, vec![json!({ "id": 1 })]);

        h.manager.connect(ChannelId::Game, Some(GAME_PATH));
        settle().await;

        assert_eq!(
            h.transport.urls(),
            vec!["ws://localhost:3000/ws?chatPath=games%2F42".to_string()]
        );
        assert_eq!(h.api.calls(), vec![(GAME_PATH.to_string(), 30)]);
        assert_eq!(h.store.loading(ChannelId::Game), vec![true, false]);
        assert_eq!(h.store.replaced(ChannelId::Game), vec![vec![json!({ "id": 1 })]]);

        let snap = snapshot(&h, ChannelId::Game).await;
        assert_eq!(snap.path.as_deref(), Some(GAME_PATH));
        assert_eq!(snap.state, ConnectionState::Connecting);
        assert!(snap.is_connecting);

        h.transport.last().expect("socket").accept();
        settle().await;

        let snap = snapshot(&h, ChannelId::Game).await;
        assert_eq!(snap.state, ConnectionState::Connected);
        assert!(!snap.is_connecting);
        assert_eq!(snap.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_connect_to_same_path_only_refreshes_history() {
        let h = harness();

        h.manager.connect(ChannelId::Gang, Some(GANG_PATH));
        h.manager.connect(ChannelId::Gang, Some(GANG_PATH));
        settle().await;
        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.api.calls_for(GANG_PATH), 2);

        h.transport.last().expect("socket").accept();
        settle().await;
        h.manager.connect(ChannelId::Gang, Some(GANG_PATH));
        settle().await;

        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.api.calls_for(GANG_PATH), 3);
        assert_eq!(snapshot(&h, ChannelId::Gang).await.state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_to_other_path_while_handshaking_is_ignored() {
        let h = harness();

        h.manager.connect(ChannelId::Game, Some("games/1"));
        settle().await;
        h.manager.connect(ChannelId::Game, Some("games/2"));
        settle().await;

        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.api.calls_for("games/2"), 0);
        assert_eq!(snapshot(&h, ChannelId::Game).await.path.as_deref(), Some("games/1"));
    }

    #[tokio::test(start_paused = true)]
    async fn new_path_replaces_open_socket() {
        let h = harness();
        let first = connected(&h, ChannelId::Game, "games/1").await;

        h.manager.connect(ChannelId::Game, Some("games/2"));
        settle().await;

        assert_eq!(
            first.closed_with(),
            Some((NORMAL_CLOSURE, "New game connection requested".to_string()))
        );
        assert_eq!(h.transport.open_count(), 2);

        // Late events from the replaced socket change nothing.
        first.drop_connection(ABNORMAL_CLOSURE, "late");
        first.push(r#"{"late":true}"#);
        settle().await;

        let snap = snapshot(&h, ChannelId::Game).await;
        assert_eq!(snap.path.as_deref(), Some("games/2"));
        assert_eq!(snap.state, ConnectionState::Connecting);
        assert_eq!(snap.pending_reconnect, None);
        assert!(h.store.read_flags(ChannelId::Game).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn involuntary_closes_back_off_until_budget_is_spent() {
        let h = harness();
        let policy = ChatConfig::default().reconnect;
        let mut socket = connected(&h, ChannelId::Game, GAME_PATH).await;

        for attempt in 0..10u32 {
            let expected = policy.delay_for(attempt).expect("within budget");
            let closed_at = Instant::now();
            socket.drop_connection(ABNORMAL_CLOSURE, "network lost");
            settle().await;

            let snap = snapshot(&h, ChannelId::Game).await;
            assert_eq!(snap.state, ConnectionState::Reconnecting);
            assert_eq!(snap.pending_reconnect, Some(expected));

            tokio::time::sleep(expected).await;
            assert_eq!(h.transport.open_count(), attempt as usize + 2);

            socket = h.transport.last().expect("reconnect socket");
            assert_eq!(socket.opened_at - closed_at, expected);
            assert_eq!(
                socket.request.url,
                "ws://localhost:3000/ws?chatPath=games%2F42"
            );
            assert_eq!(snapshot(&h, ChannelId::Game).await.reconnect_attempts, attempt + 1);
        }

        assert_eq!(
            policy.delay_for(4),
            Some(Duration::from_millis(5062)),
            "1000 * 1.5^4 truncated"
        );

        socket.drop_connection(ABNORMAL_CLOSURE, "network lost");
        settle().await;

        let snap = snapshot(&h, ChannelId::Game).await;
        assert_eq!(snap.state, ConnectionState::Failed);
        assert_eq!(snap.pending_reconnect, None);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.transport.open_count(), 11);

        // A fresh connect starts over.
        h.manager.connect(ChannelId::Game, Some(GAME_PATH));
        settle().await;
        assert_eq!(h.transport.open_count(), 12);
        let snap = snapshot(&h, ChannelId::Game).await;
        assert_eq!(snap.state, ConnectionState::Connecting);
        assert_eq!(snap.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_capped() {
        let mut config = ChatConfig::default();
        config.reconnect.max_attempts = 20;
        let h = Harness::start(config);
        let mut socket = connected(&h, ChannelId::Gang, GANG_PATH).await;

        for _ in 0..12 {
            socket.drop_connection(ABNORMAL_CLOSURE, "network lost");
            settle().await;
            let pending = snapshot(&h, ChannelId::Gang)
                .await
                .pending_reconnect
                .expect("reconnect scheduled");
            assert!(pending <= Duration::from_secs(30));
            tokio::time::sleep(pending).await;
            socket = h.transport.last().expect("socket");
        }

        socket.drop_connection(ABNORMAL_CLOSURE, "network lost");
        settle().await;
        assert_eq!(
            snapshot(&h, ChannelId::Gang).await.pending_reconnect,
            Some(Duration::from_secs(30))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_attempts() {
        let h = harness();
        let socket = connected(&h, ChannelId::Game, GAME_PATH).await;

        socket.drop_connection(ABNORMAL_CLOSURE, "gone");
        settle().await;
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let second = h.transport.last().expect("socket");
        second.drop_connection(ABNORMAL_CLOSURE, "gone");
        settle().await;
        assert_eq!(
            snapshot(&h, ChannelId::Game).await.pending_reconnect,
            Some(Duration::from_millis(1500))
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let third = h.transport.last().expect("socket");
        third.accept();
        settle().await;
        assert_eq!(snapshot(&h, ChannelId::Game).await.reconnect_attempts, 0);

        third.drop_connection(ABNORMAL_CLOSURE, "gone");
        settle().await;
        assert_eq!(
            snapshot(&h, ChannelId::Game).await.pending_reconnect,
            Some(Duration::from_millis(1000))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn normal_close_from_server_does_not_reconnect() {
        let h = harness();
        let socket = connected(&h, ChannelId::Game, GAME_PATH).await;

        socket.drop_connection(NORMAL_CLOSURE, "bye");
        settle().await;

        let snap = snapshot(&h, ChannelId::Game).await;
        assert_eq!(snap.state, ConnectionState::Disconnected);
        assert_eq!(snap.pending_reconnect, None);
        assert_eq!(snap.path.as_deref(), Some(GAME_PATH));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_clears_connecting_and_waits_for_close() {
        let h = harness();
        h.manager.connect(ChannelId::Game, Some(GAME_PATH));
        settle().await;
        let socket = h.transport.last().expect("socket");

        socket.fail("handshake refused");
        settle().await;
        let snap = snapshot(&h, ChannelId::Game).await;
        assert!(!snap.is_connecting);
        assert!(snap.has_socket);
        assert_eq!(snap.pending_reconnect, None);

        socket.drop_connection(ABNORMAL_CLOSURE, "handshake refused");
        settle().await;
        assert_eq!(
            snapshot(&h, ChannelId::Game).await.pending_reconnect,
            Some(Duration::from_millis(1000))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_to_new_path_cancels_pending_reconnect() {
        let h = harness();
        let socket = connected(&h, ChannelId::Game, "games/1").await;
        socket.drop_connection(ABNORMAL_CLOSURE, "gone");
        settle().await;
        assert!(snapshot(&h, ChannelId::Game).await.pending_reconnect.is_some());

        h.manager.connect(ChannelId::Game, Some("games/2"));
        settle().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(
            h.transport.urls(),
            vec![
                "ws://localhost:3000/ws?chatPath=games%2F1".to_string(),
                "ws://localhost:3000/ws?chatPath=games%2F2".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_open_socket_and_cancels_timers() {
        let h = harness();
        let game = connected(&h, ChannelId::Game, GAME_PATH).await;
        let gang = connected(&h, ChannelId::Gang, GANG_PATH).await;
        gang.drop_connection(ABNORMAL_CLOSURE, "gone");
        settle().await;
        assert!(snapshot(&h, ChannelId::Gang).await.pending_reconnect.is_some());

        h.manager.disconnect();
        settle().await;

        assert_eq!(
            game.closed_with(),
            Some((NORMAL_CLOSURE, "Client initiated disconnect".to_string()))
        );
        for channel in ChannelId::ALL {
            let snap = snapshot(&h, channel).await;
            assert_eq!(snap.path, None);
            assert_eq!(snap.state, ConnectionState::Disconnected);
            assert_eq!(snap.pending_reconnect, None);
            assert!(!snap.has_socket);
        }

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_or_missing_path_disconnects_channel() {
        let h = harness();

        for path in [None, Some("")] {
            let socket = connected(&h, ChannelId::Game, GAME_PATH).await;
            let calls = h.api.calls().len();

            h.manager.connect(ChannelId::Game, path);
            settle().await;

            assert_eq!(
                socket.closed_with(),
                Some((NORMAL_CLOSURE, "path became null".to_string()))
            );
            let snap = snapshot(&h, ChannelId::Game).await;
            assert_eq!(snap.path, None);
            assert_eq!(snap.state, ConnectionState::Disconnected);
            assert!(!snap.is_connecting);
            assert_eq!(snap.reconnect_attempts, 0);
            assert_eq!(h.api.calls().len(), calls);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn message_refreshes_history_and_tracks_read_state() {
        let h = harness();
        h.api.respond_with(GAME_PATH, vec![json!({ "text": "gg" })]);
        let socket = connected(&h, ChannelId::Game, GAME_PATH).await;

        h.store.set_displayed_path(Some(GAME_PATH));
        socket.push(r#"{"type":"message"}"#);
        settle().await;

        h.store.set_displayed_path(Some(GANG_PATH));
        socket.push(r#"{"type":"message"}"#);
        settle().await;

        h.store.set_displayed_path(None);
        socket.push(r#"{"type":"message"}"#);
        settle().await;

        assert_eq!(h.api.calls_for(GAME_PATH), 4);
        assert_eq!(h.store.read_flags(ChannelId::Game), vec![true, false, false]);
        assert_eq!(h.store.replaced(ChannelId::Game).len(), 4);
        assert!(h.store.read_flags(ChannelId::Gang).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_message_is_dropped() {
        let h = harness();
        let socket = connected(&h, ChannelId::Game, GAME_PATH).await;

        socket.push("not json {");
        settle().await;

        assert_eq!(h.api.calls_for(GAME_PATH), 1);
        assert!(h.store.read_flags(ChannelId::Game).is_empty());
        assert_eq!(snapshot(&h, ChannelId::Game).await.state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn send_routes_to_channel_owning_path() {
        let h = harness();
        let game = connected(&h, ChannelId::Game, GAME_PATH).await;
        let gang = connected(&h, ChannelId::Gang, GANG_PATH).await;

        let message = json!({ "text": "hello" });
        assert!(h.manager.send_message(GANG_PATH, &message).await);
        assert!(game.sent().is_empty());
        assert_eq!(gang.sent(), vec![message.to_string()]);

        assert!(!h.manager.send_message("games/999", &message).await);
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_handshaking_fails_without_new_socket() {
        let h = harness();
        h.manager.connect(ChannelId::Game, Some(GAME_PATH));
        settle().await;

        assert!(!h.manager.send_message(GAME_PATH, &json!({ "text": "hi" })).await);
        settle().await;
        assert_eq!(h.transport.open_count(), 1);
        assert!(h.transport.last().expect("socket").sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_reconnect_pending_reconnects_now() {
        let h = harness();
        let socket = connected(&h, ChannelId::Game, GAME_PATH).await;
        socket.drop_connection(ABNORMAL_CLOSURE, "gone");
        settle().await;

        assert!(!h.manager.send_message(GAME_PATH, &json!({ "text": "hi" })).await);
        settle().await;

        assert_eq!(h.transport.open_count(), 2);
        let snap = snapshot(&h, ChannelId::Game).await;
        assert_eq!(snap.pending_reconnect, None);
        assert_eq!(snap.state, ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn history_for_abandoned_path_is_discarded() {
        let h = harness();
        h.api
            .respond_after("games/1", vec![json!({ "old": true })], Duration::from_secs(5));
        h.api.respond_with("games/2", vec![json!({ "new": true })]);

        connected(&h, ChannelId::Game, "games/1").await;
        h.manager.connect(ChannelId::Game, Some("games/2"));
        settle().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(
            h.store.replaced(ChannelId::Game),
            vec![vec![json!({ "new": true })]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_older_history_does_not_overwrite_newer() {
        let h = harness();
        h.api
            .respond_after(GAME_PATH, vec![json!({ "seq": 1 })], Duration::from_secs(5));
        let socket = connected(&h, ChannelId::Game, GAME_PATH).await;

        h.api.respond_with(GAME_PATH, vec![json!({ "seq": 2 })]);
        socket.push(r#"{"type":"message"}"#);
        settle().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(
            h.store.replaced(ChannelId::Game),
            vec![vec![json!({ "seq": 2 })]]
        );
        assert_eq!(h.store.loading(ChannelId::Game), vec![true, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn loading_stays_set_until_latest_fetch_finishes() {
        let h = harness();
        h.api
            .respond_after(GANG_PATH, vec![json!({ "seq": 1 })], Duration::from_secs(2));
        h.manager.connect(ChannelId::Gang, Some(GANG_PATH));
        settle().await;

        h.api
            .respond_after(GANG_PATH, vec![json!({ "seq": 2 })], Duration::from_secs(5));
        h.manager.connect(ChannelId::Gang, Some(GANG_PATH));
        settle().await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.store.loading(ChannelId::Gang), vec![true, true]);
        assert!(h.store.replaced(ChannelId::Gang).is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.store.loading(ChannelId::Gang), vec![true, true, false]);
        assert_eq!(
            h.store.replaced(ChannelId::Gang),
            vec![vec![json!({ "seq": 2 })]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn history_failure_still_clears_loading() {
        let h = harness();
        h.api.fail_with(
            GAME_PATH,
            ApiError::Status {
                status: 500,
                body: "boom".to_string(),
            },
        );

        h.manager.connect(ChannelId::Game, Some(GAME_PATH));
        settle().await;

        assert_eq!(h.store.loading(ChannelId::Game), vec![true, false]);
        assert!(h.store.replaced(ChannelId::Game).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_uses_current_credentials() {
        let h = harness();
        h.credentials
            .save_headers(&[HeaderPair::new("Authorization", "Bearer old")])
            .await
            .expect("save");
        let socket = connected(&h, ChannelId::Game, GAME_PATH).await;
        assert_eq!(
            socket.request.headers,
            vec![HeaderPair::new("Authorization", "Bearer old")]
        );

        h.credentials
            .save_headers(&[HeaderPair::new("Authorization", "Bearer new")])
            .await
            .expect("save");
        socket.drop_connection(ABNORMAL_CLOSURE, "gone");
        settle().await;
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(
            h.transport.last().expect("socket").request.headers,
            vec![HeaderPair::new("Authorization", "Bearer new")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn channels_are_independent() {
        let h = harness();
        let game = connected(&h, ChannelId::Game, GAME_PATH).await;
        connected(&h, ChannelId::Gang, GANG_PATH).await;

        game.drop_connection(ABNORMAL_CLOSURE, "gone");
        settle().await;

        assert_eq!(
            snapshot(&h, ChannelId::Game).await.state,
            ConnectionState::Reconnecting
        );
        let gang = snapshot(&h, ChannelId::Gang).await;
        assert_eq!(gang.state, ConnectionState::Connected);
        assert_eq!(gang.pending_reconnect, None);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_changes_are_published() {
        let h = harness();
        let socket = connected(&h, ChannelId::Game, GAME_PATH).await;
        socket.drop_connection(ABNORMAL_CLOSURE, "gone");
        settle().await;
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(
            h.store.states(ChannelId::Game),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
                ConnectionState::Connecting,
            ]
        );
        assert_eq!(
            h.store.states(ChannelId::Gang),
            vec![ConnectionState::Disconnected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_last_handle_closes_sockets() {
        let Harness {
            manager, transport, ..
        } = harness();
        manager.connect(ChannelId::Game, Some(GAME_PATH));
        settle().await;
        let socket = transport.last().expect("socket");
        socket.accept();
        settle().await;

        drop(manager);
        settle().await;

        assert_eq!(
            socket.closed_with(),
            Some((NORMAL_CLOSURE, "Client shutting down".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn displayed_chat_is_marked_read() {
        let mut store = MockChatStore::new();
        store
            .expect_displayed_path()
            .returning(|| Some(GAME_PATH.to_string()));
        store
            .expect_dispatch()
            .withf(|action| !matches!(action, ChatAction::SetMessagesRead { read: false, .. }))
            .returning(|_| ());

        let transport = FakeTransport::new();
        let manager = ChatConnectionManager::spawn(
            ChatConfig::default(),
            ChatDependencies {
                transport: Arc::new(transport.clone()),
                api: Arc::new(StubChatApi::new()),
                store: Arc::new(store),
                credentials: CredentialStore::new(Arc::new(MemoryKeyValueStore::default())),
            },
        );

        manager.connect(ChannelId::Game, Some(GAME_PATH));
        settle().await;
        let socket = transport.last().expect("socket");
        socket.accept();
        socket.push("{}");
        settle().await;

        // An unexpected dispatch panics inside the event loop and ends it.
        assert!(manager.snapshot(ChannelId::Game).await.is_some());
    }
}
