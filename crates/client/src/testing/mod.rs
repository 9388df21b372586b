//! In-process fakes for driving [`ChatConnectionManager`] without a network.
//!
//! [`FakeTransport`] records every socket the manager opens and lets a test
//! play the server side (open, push a message, drop the connection).
//! [`RecordingStore`] keeps every dispatched [`ChatAction`] and
//! [`StubChatApi`] answers history requests from canned responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::channel::{ChannelId, ConnectionState};
use crate::config::ChatConfig;
use crate::infrastructure::storage::{CredentialStore, MemoryKeyValueStore};
use crate::manager::{ChatConnectionManager, ChatDependencies};
use crate::ports::outbound::{
    ApiError, ChatAction, ChatApiPort, ChatStore, ChatTransport, SocketEvent, SocketEventSink,
    SocketHandle, SocketRequest, TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Transport
// =============================================================================

#[derive(Clone, Default)]
pub struct FakeTransport {
    sockets: Arc<Mutex<Vec<FakeSocket>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.sockets).len()
    }

    pub fn last(&self) -> Option<FakeSocket> {
        lock(&self.sockets).last().cloned()
    }

    pub fn urls(&self) -> Vec<String> {
        lock(&self.sockets)
            .iter()
            .map(|s| s.request.url.clone())
            .collect()
    }
}

impl ChatTransport for FakeTransport {
    fn open(&self, request: SocketRequest, events: SocketEventSink) -> Box<dyn SocketHandle> {
        let socket = FakeSocket {
            request,
            opened_at: Instant::now(),
            events,
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(None)),
        };
        lock(&self.sockets).push(socket.clone());
        Box::new(FakeSocketHandle { socket })
    }
}

/// Server-side view of one socket opened by the manager.
#[derive(Clone)]
pub struct FakeSocket {
    pub request: SocketRequest,
    pub opened_at: Instant,
    events: SocketEventSink,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
}

impl FakeSocket {
    /// Complete the handshake.
    pub fn accept(&self) {
        self.events.emit(SocketEvent::Open);
    }

    pub fn push(&self, text: impl Into<String>) {
        self.events.emit(SocketEvent::Message(text.into()));
    }

    pub fn fail(&self, error: impl Into<String>) {
        self.events.emit(SocketEvent::Error(error.into()));
    }

    /// Close from the server side.
    pub fn drop_connection(&self, code: u16, reason: &str) {
        self.events.emit(SocketEvent::close(code, reason));
    }

    /// Frames the client sent on this socket.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// Code and reason of a client-side close, if any.
    pub fn closed_with(&self) -> Option<(u16, String)> {
        lock(&self.closed).clone()
    }
}

struct FakeSocketHandle {
    socket: FakeSocket,
}

impl SocketHandle for FakeSocketHandle {
    fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.socket.closed_with().is_some() {
            return Err(TransportError::Closed);
        }
        lock(&self.socket.sent).push(text);
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        *lock(&self.socket.closed) = Some((code, reason.to_string()));
        // A real socket reports its own close back asynchronously.
        self.socket.events.emit(SocketEvent::close(code, reason));
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Clone, Default)]
pub struct RecordingStore {
    actions: Arc<Mutex<Vec<ChatAction>>>,
    displayed: Arc<Mutex<Option<String>>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_displayed_path(&self, path: Option<&str>) {
        *lock(&self.displayed) = path.map(str::to_string);
    }

    pub fn loading(&self, channel: ChannelId) -> Vec<bool> {
        self.filter(channel, |action| match action {
            ChatAction::SetLoading { loading, .. } => Some(*loading),
            _ => None,
        })
    }

    pub fn replaced(&self, channel: ChannelId) -> Vec<Vec<Value>> {
        self.filter(channel, |action| match action {
            ChatAction::ReplaceMessages { messages, .. } => Some(messages.clone()),
            _ => None,
        })
    }

    pub fn read_flags(&self, channel: ChannelId) -> Vec<bool> {
        self.filter(channel, |action| match action {
            ChatAction::SetMessagesRead { read, .. } => Some(*read),
            _ => None,
        })
    }

    pub fn states(&self, channel: ChannelId) -> Vec<ConnectionState> {
        self.filter(channel, |action| match action {
            ChatAction::ConnectionChanged { state, .. } => Some(*state),
            _ => None,
        })
    }

    fn filter<T>(&self, channel: ChannelId, pick: impl Fn(&ChatAction) -> Option<T>) -> Vec<T> {
        lock(&self.actions)
            .iter()
            .filter(|action| action.channel() == channel)
            .filter_map(pick)
            .collect()
    }
}

impl ChatStore for RecordingStore {
    fn dispatch(&self, action: ChatAction) {
        lock(&self.actions).push(action);
    }

    fn displayed_path(&self) -> Option<String> {
        lock(&self.displayed).clone()
    }
}

// =============================================================================
// History API
// =============================================================================

#[derive(Clone)]
struct CannedResponse {
    result: Result<Vec<Value>, ApiError>,
    delay: Duration,
}

/// Answers history requests per path; unknown paths get an empty list.
#[derive(Clone, Default)]
pub struct StubChatApi {
    responses: Arc<Mutex<HashMap<String, CannedResponse>>>,
    calls: Arc<Mutex<Vec<(String, u32)>>>,
}

impl StubChatApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with(&self, path: &str, messages: Vec<Value>) {
        self.respond_after(path, messages, Duration::ZERO);
    }

    /// Like [`respond_with`](Self::respond_with), but the answer takes `delay`.
    pub fn respond_after(&self, path: &str, messages: Vec<Value>, delay: Duration) {
        lock(&self.responses).insert(
            path.to_string(),
            CannedResponse {
                result: Ok(messages),
                delay,
            },
        );
    }

    pub fn fail_with(&self, path: &str, error: ApiError) {
        lock(&self.responses).insert(
            path.to_string(),
            CannedResponse {
                result: Err(error),
                delay: Duration::ZERO,
            },
        );
    }

    /// `(path, limit)` of every request, in order.
    pub fn calls(&self) -> Vec<(String, u32)> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, path: &str) -> usize {
        lock(&self.calls).iter().filter(|(p, _)| p == path).count()
    }
}

#[async_trait::async_trait]
impl ChatApiPort for StubChatApi {
    async fn fetch_messages(&self, chat_path: &str, limit: u32) -> Result<Vec<Value>, ApiError> {
        lock(&self.calls).push((chat_path.to_string(), limit));
        let canned = lock(&self.responses).get(chat_path).cloned();
        match canned {
            Some(canned) => {
                if !canned.delay.is_zero() {
                    tokio::time::sleep(canned.delay).await;
                }
                canned.result
            }
            None => Ok(Vec::new()),
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A manager wired to fakes, plus handles on those fakes.
pub struct Harness {
    pub manager: ChatConnectionManager,
    pub transport: FakeTransport,
    pub api: StubChatApi,
    pub store: RecordingStore,
    pub credentials: CredentialStore,
}

impl Harness {
    /// Must be called from within a tokio runtime.
    pub fn start(config: ChatConfig) -> Self {
        let transport = FakeTransport::new();
        let api = StubChatApi::new();
        let store = RecordingStore::new();
        let credentials = CredentialStore::new(Arc::new(MemoryKeyValueStore::default()));

        let manager = ChatConnectionManager::spawn(
            config,
            ChatDependencies {
                transport: Arc::new(transport.clone()),
                api: Arc::new(api.clone()),
                store: Arc::new(store.clone()),
                credentials: credentials.clone(),
            },
        );

        Self {
            manager,
            transport,
            api,
            store,
            credentials,
        }
    }
}
