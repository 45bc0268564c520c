//! Feed supervisor
//!
//! Owns the WebSocket connection. Each session connects, configures the
//! stream, subscribes to the book and trade channels and pumps frames into a
//! fresh [`ChannelDispatcher`]. However a session ends, its dispatcher is
//! closed so buffered rows are flushed before the next connection.
//!
//! ```text
//!   ┌──────────── run ────────────┐
//!   │ connect ─► conf ─► subscribe │
//!   │    │                         │
//!   │    ▼                         │
//!   │  pump frames ─► dispatcher   │
//!   │    │ close / info / stale    │
//!   │    ▼                         │
//!   │  dispatcher.close()          │
//!   │    │ reconnect_delay         │
//!   └────┴─────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{error, info, info_span, warn, Instrument};
use types::ids::PairId;
use uuid::Uuid;

use crate::book::BookSettings;
use crate::config::{CaptureConfig, FeedConfig};
use crate::dispatcher::{ChannelDispatcher, Dispatched};
use crate::error::CaptureError;
use crate::events::{ControlEvent, INFO_MAINTENANCE_END, INFO_MAINTENANCE_START, INFO_RECONNECT};
use crate::sink::StorageSink;

/// Message timestamps (32768) plus decimals as strings (8).
pub const CONF_FLAGS: u64 = 32768 + 8;

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Shutdown,
    Reconnect { reason: String },
}

impl SessionEnd {
    fn reconnect(reason: impl Into<String>) -> Self {
        SessionEnd::Reconnect { reason: reason.into() }
    }
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

pub struct FeedSupervisor {
    feed: FeedConfig,
    pair_id: PairId,
    book: BookSettings,
    sink: Arc<dyn StorageSink>,
}

impl FeedSupervisor {
    pub fn new(config: &CaptureConfig, sink: Arc<dyn StorageSink>) -> Self {
        Self {
            feed: config.feed.clone(),
            pair_id: config.pair_id,
            book: config.book,
            sink,
        }
    }

    /// Run sessions back to back until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(url = %self.feed.url, pair = %self.feed.pair, "Feed supervisor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let session_id = Uuid::now_v7();
            let span = info_span!("session", %session_id, pair = %self.feed.pair);
            match self.run_session(&mut shutdown).instrument(span).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Reconnect { reason }) => {
                    warn!(%session_id, %reason, "Session ended, reconnecting");
                }
                Err(e) => error!(%session_id, error = %e, "Session failed"),
            }

            tokio::select! {
                _ = sleep(self.feed.reconnect_delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Feed supervisor stopped");
    }

    /// One connection from connect to close.
    pub async fn run_session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd, FeedError> {
        info!(url = %self.feed.url, "Connecting");
        let connect = connect_async(self.feed.url.as_str());
        tokio::pin!(connect);
        let (stream, _response) = loop {
            tokio::select! {
                connected = &mut connect => break connected?,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested while connecting");
                        return Ok(SessionEnd::Shutdown);
                    }
                }
            }
        };
        let (mut write, mut read) = stream.split();

        for request in subscribe_requests(&self.feed) {
            write.send(Message::Text(request)).await?;
        }

        let mut dispatcher = ChannelDispatcher::new(self.pair_id, self.book, Arc::clone(&self.sink));
        let ended = pump(&mut dispatcher, &mut write, &mut read, shutdown, self.feed.stale_after).await;

        if let Err(e) = dispatcher.close().await {
            error!(error = %e, "Dispatcher close incomplete");
        }
        if let Err(e) = write.close().await {
            info!(error = %e, "Connection already closed");
        }

        ended
    }
}

/// Requests sent right after connecting.
pub fn subscribe_requests(feed: &FeedConfig) -> Vec<String> {
    vec![
        json!({ "event": "conf", "flags": CONF_FLAGS }).to_string(),
        json!({
            "event": "subscribe",
            "channel": "book",
            "prec": feed.book_precision,
            "len": feed.book_length,
            "symbol": feed.symbol(),
        })
        .to_string(),
        json!({ "event": "subscribe", "channel": "trades", "symbol": feed.symbol() }).to_string(),
    ]
}

/// Supervisor reaction to a control event the dispatcher passed back.
pub fn on_control(event: &ControlEvent) -> Option<SessionEnd> {
    match event {
        ControlEvent::Info { code: Some(INFO_RECONNECT), msg, .. } => {
            warn!(msg = msg.as_deref().unwrap_or(""), "Server requested reconnect");
            Some(SessionEnd::reconnect("server requested reconnect"))
        }
        ControlEvent::Info { code: Some(INFO_MAINTENANCE_START), .. } => {
            warn!("Exchange maintenance started");
            None
        }
        ControlEvent::Info { code: Some(INFO_MAINTENANCE_END), .. } => {
            info!("Exchange maintenance ended, resubscribing");
            Some(SessionEnd::reconnect("maintenance ended"))
        }
        ControlEvent::Info { version, code, msg } => {
            info!(?version, ?code, msg = msg.as_deref().unwrap_or(""), "Info");
            None
        }
        ControlEvent::Conf { status, flags } => {
            info!(?status, ?flags, "Connection configured");
            None
        }
        ControlEvent::Error { code, msg } => {
            error!(?code, msg = msg.as_deref().unwrap_or(""), "Exchange reported an error");
            None
        }
        ControlEvent::Subscribed(_) | ControlEvent::Unsubscribed { .. } => None,
    }
}

async fn pump<W, R>(
    dispatcher: &mut ChannelDispatcher,
    write: &mut W,
    read: &mut R,
    shutdown: &mut watch::Receiver<bool>,
    stale_after: Duration,
) -> Result<SessionEnd, FeedError>
where
    W: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Shutdown requested");
                    return Ok(SessionEnd::Shutdown);
                }
                continue;
            }
            next = timeout(stale_after, read.next()) => next,
        };

        let message = match next {
            Err(_) => {
                warn!(stale_secs = stale_after.as_secs(), "No frames received, connection is stale");
                return Ok(SessionEnd::reconnect("stale connection"));
            }
            Ok(None) => return Ok(SessionEnd::reconnect("stream ended")),
            Ok(Some(frame)) => frame?,
        };

        match message {
            Message::Text(text) => match dispatcher.on_message(Utc::now(), &text).await {
                Ok(Dispatched::Control(event)) => {
                    if let Some(end) = on_control(&event) {
                        return Ok(end);
                    }
                }
                Ok(_) => {}
                Err(CaptureError::Flush(e)) => {
                    error!(
                        channel_id = %e.channel_id,
                        rows = e.rows.len(),
                        error = %e.source,
                        "Dropping batch after failed flush"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Protocol fault, ending session");
                    return Err(e.into());
                }
            },
            Message::Ping(payload) => write.send(Message::Pong(payload)).await?,
            Message::Close(frame) => {
                info!(?frame, "Server closed connection");
                return Ok(SessionEnd::reconnect("closed by server"));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use types::errors::ProtocolError;
    use types::ids::ChannelId;

    /// Serve one connection: collect the three subscribe requests, send
    /// `frames`, then either close or wait for the client to leave.
    async fn serve_once(frames: Vec<&'static str>, close: bool) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let mut received = Vec::new();
            while received.len() < 3 {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => received.push(text),
                    other => panic!("Expected subscribe request, got {:?}", other),
                }
            }
            for frame in frames {
                ws.send(Message::Text(frame.to_string())).await.unwrap();
            }
            if close {
                let _ = ws.close(None).await;
            } else {
                while let Some(Ok(_)) = ws.next().await {}
            }
            received
        });

        (url, handle)
    }

    fn make_supervisor(url: String, sink: Arc<MemorySink>) -> FeedSupervisor {
        let mut config = CaptureConfig::default();
        config.feed.url = url;
        FeedSupervisor::new(&config, sink)
    }

    #[test]
    fn test_subscribe_requests() {
        let requests: Vec<Value> = subscribe_requests(&FeedConfig::default())
            .iter()
            .map(|r| serde_json::from_str(r).unwrap())
            .collect();

        assert_eq!(requests[0], json!({"event": "conf", "flags": 32776}));
        assert_eq!(
            requests[1],
            json!({"event": "subscribe", "channel": "book", "prec": "R0", "len": 100, "symbol": "tBTCUSD"})
        );
        assert_eq!(requests[2], json!({"event": "subscribe", "channel": "trades", "symbol": "tBTCUSD"}));
    }

    #[test]
    fn test_control_reactions() {
        let info = |code| ControlEvent::Info {
            version: None,
            code: Some(code),
            msg: None,
        };
        assert!(matches!(on_control(&info(20051)), Some(SessionEnd::Reconnect { .. })));
        assert_eq!(on_control(&info(20060)), None);
        assert!(matches!(on_control(&info(20061)), Some(SessionEnd::Reconnect { .. })));
        assert_eq!(
            on_control(&ControlEvent::Error {
                code: Some(10300),
                msg: Some("Subscription failed".to_string())
            }),
            None
        );
    }

    #[tokio::test]
    async fn test_session_flushes_when_server_closes() {
        let (url, server) = serve_once(
            vec![
                r#"{"event":"info","version":2,"platform":{"status":1}}"#,
                r#"{"event":"subscribed","channel":"book","chanId":10,"symbol":"tBTCUSD","prec":"R0","len":"100","pair":"BTCUSD"}"#,
                r#"[10,[[1,"7000","1"],[2,"7001","-2"]],1574694478000]"#,
                r#"[10,[3,"7002","1"],1574694478100]"#,
            ],
            true,
        )
        .await;
        let sink = Arc::new(MemorySink::new());
        let supervisor = make_supervisor(url, sink.clone());
        let (_tx, mut rx) = watch::channel(false);

        let end = supervisor.run_session(&mut rx).await.unwrap();
        assert_eq!(end, SessionEnd::reconnect("closed by server"));

        let requests = server.await.unwrap();
        assert!(requests[0].contains("conf"));

        assert_eq!(sink.markers().len(), 1);
        let rows = sink.book_rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.channel_id == ChannelId::new(10)));
    }

    #[tokio::test]
    async fn test_reconnect_info_ends_session() {
        let (url, _server) = serve_once(vec![r#"{"event":"info","code":20051,"msg":"Stopping"}"#], false).await;
        let sink = Arc::new(MemorySink::new());
        let supervisor = make_supervisor(url, sink);
        let (_tx, mut rx) = watch::channel(false);

        let end = supervisor.run_session(&mut rx).await.unwrap();
        assert_eq!(end, SessionEnd::reconnect("server requested reconnect"));
    }

    #[tokio::test]
    async fn test_unknown_channel_ends_session_with_error() {
        let (url, _server) = serve_once(vec![r#"[77,[1,"7000","1"],1574694478000]"#], false).await;
        let sink = Arc::new(MemorySink::new());
        let supervisor = make_supervisor(url, sink);
        let (_tx, mut rx) = watch::channel(false);

        match supervisor.run_session(&mut rx).await {
            Err(FeedError::Capture(CaptureError::Protocol(ProtocolError::UnknownChannel { channel_id }))) => {
                assert_eq!(channel_id, ChannelId::new(77));
            }
            other => panic!("Expected unknown channel fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_pending_connect() {
        // Accepts TCP in the backlog but never answers the handshake
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let sink = Arc::new(MemorySink::new());
        let supervisor = make_supervisor(url, sink.clone());
        let (tx, mut rx) = watch::channel(false);

        let session = tokio::spawn(async move { supervisor.run_session(&mut rx).await });
        sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let end = timeout(Duration::from_secs(5), session).await.unwrap().unwrap().unwrap();
        assert_eq!(end, SessionEnd::Shutdown);
        assert!(sink.markers().is_empty());
        drop(listener);
    }

    #[tokio::test]
    async fn test_shutdown_ends_session_and_flushes() {
        let (url, server) = serve_once(
            vec![
                r#"{"event":"subscribed","channel":"book","chanId":10,"symbol":"tBTCUSD"}"#,
                r#"[10,[[1,"7000","1"]],1574694478000]"#,
            ],
            false,
        )
        .await;
        let sink = Arc::new(MemorySink::new());
        let supervisor = make_supervisor(url, sink.clone());
        let (tx, mut rx) = watch::channel(false);

        let session = tokio::spawn(async move { supervisor.run_session(&mut rx).await });
        while sink.markers().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();

        let end = session.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Shutdown);
        assert_eq!(sink.book_rows().len(), 1);
        server.await.unwrap();
    }
}
