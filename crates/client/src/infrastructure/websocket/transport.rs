//! Websocket transport using tokio-tungstenite

use std::borrow::Cow;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::ports::outbound::{
    ChatTransport, SocketEvent, SocketEventSink, SocketHandle, SocketRequest, TransportError,
    ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};

/// Close code reported when the peer sent a close frame without a code.
const NO_STATUS_RECEIVED: u16 = 1005;

enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Opens one tokio task per socket; the task owns the stream.
#[derive(Debug, Clone)]
pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl ChatTransport for WsTransport {
    fn open(&self, request: SocketRequest, events: SocketEventSink) -> Box<dyn SocketHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(request, self.connect_timeout, rx, events));
        Box::new(WsSocketHandle { tx })
    }
}

struct WsSocketHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SocketHandle for WsSocketHandle {
    fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self, code: u16, reason: &str) {
        // The socket task may already be gone; nothing left to close then.
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

fn build_request(request: &SocketRequest) -> Result<Request, TransportError> {
    let mut ws_request = request
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

    for header in &request.headers {
        let name = HeaderName::from_bytes(header.key.as_bytes()).map_err(|e| {
            TransportError::InvalidHeader {
                name: header.key.clone(),
                message: e.to_string(),
            }
        })?;
        let value =
            HeaderValue::from_str(&header.value).map_err(|e| TransportError::InvalidHeader {
                name: header.key.clone(),
                message: e.to_string(),
            })?;
        ws_request.headers_mut().insert(name, value);
    }

    Ok(ws_request)
}

async fn run_socket(
    request: SocketRequest,
    connect_timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    events: SocketEventSink,
) {
    let ws_request = match build_request(&request) {
        Ok(r) => r,
        Err(e) => {
            fail(&events, e);
            return;
        }
    };

    let connect = tokio::time::timeout(connect_timeout, connect_async(ws_request));
    let ws_stream = tokio::select! {
        result = connect => match result {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                fail(&events, TransportError::Handshake(e.to_string()));
                return;
            }
            Err(_) => {
                fail(&events, TransportError::Timeout(connect_timeout.as_millis() as u64));
                return;
            }
        },
        cmd = recv_close(&mut rx) => {
            // Closed (or handle dropped) before the handshake finished
            let (code, reason) = cmd;
            events.emit(SocketEvent::close(code, reason));
            return;
        }
    };

    tracing::debug!("Socket open: {}", request.url);
    events.emit(SocketEvent::Open);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => events.emit(SocketEvent::Message(text)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    events.emit(SocketEvent::close(code, reason));
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    events.emit(SocketEvent::Error(e.to_string()));
                    events.emit(SocketEvent::close(ABNORMAL_CLOSURE, e.to_string()));
                    return;
                }
                None => {
                    events.emit(SocketEvent::close(ABNORMAL_CLOSURE, "stream ended"));
                    return;
                }
            },
            outbound = rx.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        tracing::error!("Failed to send message: {}", e);
                        events.emit(SocketEvent::Error(e.to_string()));
                        events.emit(SocketEvent::close(ABNORMAL_CLOSURE, e.to_string()));
                        return;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Owned(reason.clone()),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        tracing::debug!("Close frame not delivered: {}", e);
                    }
                    events.emit(SocketEvent::close(code, reason));
                    return;
                }
                None => {
                    // Handle dropped without an explicit close
                    let _ = write.send(Message::Close(None)).await;
                    events.emit(SocketEvent::close(NORMAL_CLOSURE, "handle dropped"));
                    return;
                }
            },
        }
    }
}

/// Resolves when a close is requested or the handle is dropped.
async fn recv_close(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> (u16, String) {
    loop {
        match rx.recv().await {
            Some(Outbound::Close { code, reason }) => return (code, reason),
            Some(Outbound::Text(_)) => {
                tracing::debug!("Dropping frame queued before handshake completed");
            }
            None => return (NORMAL_CLOSURE, "handle dropped".to_string()),
        }
    }
}

fn fail(events: &SocketEventSink, error: TransportError) {
    tracing::error!("Socket failed: {}", error);
    events.emit(SocketEvent::Error(error.to_string()));
    events.emit(SocketEvent::close(ABNORMAL_CLOSURE, error.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::outbound::HeaderPair;
    use tokio::net::TcpListener;

    fn recording_sink() -> (SocketEventSink, mpsc::UnboundedReceiver<SocketEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = SocketEventSink::new(move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    async fn first_two(rx: &mut mpsc::UnboundedReceiver<SocketEvent>) -> Vec<SocketEvent> {
        let mut events = Vec::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event in time")
                .expect("sink alive");
            events.push(event);
        }
        events
    }

    fn request_to(addr: std::net::SocketAddr) -> SocketRequest {
        SocketRequest {
            url: format!("ws://{addr}/ws?chatPath=games%2F42"),
            headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn silent_server_times_out_as_abnormal_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        // Accept and hold connections without ever answering the handshake.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let (sink, mut rx) = recording_sink();
        let _handle = WsTransport::new(Duration::from_millis(200)).open(request_to(addr), sink);

        let events = first_two(&mut rx).await;
        assert_eq!(
            events,
            vec![
                SocketEvent::Error("Handshake timed out after 200ms".to_string()),
                SocketEvent::close(ABNORMAL_CLOSURE, "Handshake timed out after 200ms"),
            ]
        );
    }

    #[tokio::test]
    async fn refused_connection_is_abnormal_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let (sink, mut rx) = recording_sink();
        let _handle = WsTransport::new(Duration::from_secs(2)).open(request_to(addr), sink);

        let events = first_two(&mut rx).await;
        assert!(
            matches!(&events[0], SocketEvent::Error(message) if message.starts_with("Handshake failed")),
            "unexpected first event: {:?}",
            events[0]
        );
        assert!(matches!(
            &events[1],
            SocketEvent::Close { code, .. } if *code == ABNORMAL_CLOSURE
        ));
    }

    #[test]
    fn request_carries_headers() {
        let request = SocketRequest {
            url: "ws://localhost:3000/ws?chatPath=games%2F42".to_string(),
            headers: vec![HeaderPair::new("Authorization", "Bearer abc")],
        };

        let built = build_request(&request).expect("valid request");
        assert_eq!(built.uri().path(), "/ws");
        assert_eq!(
            built
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok()),
            Some("Bearer abc")
        );
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let request = SocketRequest {
            url: "ws://localhost:3000/ws".to_string(),
            headers: vec![HeaderPair::new("bad header", "x")],
        };

        assert!(matches!(
            build_request(&request),
            Err(TransportError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn invalid_url_is_rejected() {
        let request = SocketRequest {
            url: "not a url".to_string(),
            headers: Vec::new(),
        };

        assert!(matches!(
            build_request(&request),
            Err(TransportError::InvalidUrl(_))
        ));
    }
}
