//! WebSocket connection to the backend's change-feed endpoint.
//!
//! Each subscription runs its own connection task: connect, wait for
//! the welcome frame, subscribe to a row-mutation topic filtered to the
//! account, then forward insert/update payloads. Dropped connections
//! reconnect with exponential backoff plus jitter, and every successful
//! (re)subscribe starts with a `Resync` so consumers rebuild derived
//! state instead of trusting deltas across the gap.
//!
//! There is deliberately no timeout on event delivery; quiet accounts
//! are normal. Liveness rides on the server's ping frames instead.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::constants::{
    FEED_CHANNEL_CAPACITY, FEED_HEALTH_CHECK_INTERVAL, FEED_INITIAL_BACKOFF_SECS,
    FEED_MAX_BACKOFF_SECS, FEED_STALE_TIMEOUT, FEED_WELCOME_TIMEOUT,
};
use crate::feed::{ChangeFeed, FeedError, FeedEvent};
use crate::types::{AccountId, NotificationRecord};

type WsWrite = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;
type WsRead = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Feed protocol frame.
#[derive(Debug, Serialize, Deserialize)]
struct FeedFrame {
    command: String,
    identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

/// Subscription topic: which rows of which table this stream follows.
#[derive(Debug, Serialize, Deserialize)]
struct FeedTopic {
    channel: String,
    schema: String,
    table: String,
    filter: String,
}

/// Incoming feed protocol frame.
#[derive(Debug, Deserialize)]
struct IncomingFrame {
    #[serde(rename = "type")]
    frame_type: Option<String>,
    message: Option<serde_json::Value>,
}

/// Row-change payload carried inside a broadcast frame.
#[derive(Debug, Deserialize)]
struct ChangePayload {
    event: String,
    record: NotificationRecord,
}

/// Change feed backed by the hosted backend's websocket endpoint.
pub struct RealtimeFeed {
    server_url: String,
    api_key: String,
}

impl RealtimeFeed {
    #[must_use]
    pub fn new(server_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let server_url = server_url.into();
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(
        &self,
        account: &AccountId,
    ) -> Result<mpsc::Receiver<FeedEvent>, FeedError> {
        if !self.server_url.starts_with("http") {
            return Err(FeedError::Connect(format!(
                "unusable feed URL: {}",
                self.server_url
            )));
        }

        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        tokio::spawn(run_connection_loop(
            self.server_url.clone(),
            self.api_key.clone(),
            account.clone(),
            tx,
        ));
        Ok(rx)
    }
}

/// Reconnect-forever loop; ends only when the subscriber goes away.
async fn run_connection_loop(
    server_url: String,
    api_key: String,
    account: AccountId,
    events: mpsc::Sender<FeedEvent>,
) {
    let mut backoff_secs = FEED_INITIAL_BACKOFF_SECS;

    loop {
        if events.is_closed() {
            log::debug!("[Feed] Subscriber for account {account} gone, stopping connection loop");
            break;
        }

        match connect_and_subscribe(&server_url, &api_key, &account).await {
            Ok((write, read)) => {
                log::info!("[Feed] Change feed connected for account {account}");
                backoff_secs = FEED_INITIAL_BACKOFF_SECS;

                // Anything observed before this connection cannot be trusted
                if events.send(FeedEvent::Resync).await.is_err() {
                    break;
                }

                let subscriber_gone = run_stream(&account, write, read, &events).await;
                if subscriber_gone {
                    break;
                }
                log::warn!("[Feed] Change feed for account {account} disconnected");
            }
            Err(e) => {
                log::warn!("[Feed] Change feed connect failed for account {account}: {e}");
            }
        }

        // Exponential backoff with jitter
        let jitter_ms = rand::random::<u64>() % 1000;
        let wait_ms = backoff_secs * 1000 + jitter_ms;
        log::info!("[Feed] Reconnecting feed for account {account} in {wait_ms}ms");

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
            () = events.closed() => {
                log::debug!("[Feed] Subscriber for account {account} gone during backoff");
                break;
            }
        }

        backoff_secs = (backoff_secs * 2).min(FEED_MAX_BACKOFF_SECS);
    }
}

/// Connects, waits for the welcome frame, and subscribes to the
/// account's notification topic.
async fn connect_and_subscribe(
    server_url: &str,
    api_key: &str,
    account: &AccountId,
) -> Result<(WsWrite, WsRead), FeedError> {
    let ws_url = format!(
        "{}/feed",
        server_url
            .replace("https://", "wss://")
            .replace("http://", "ws://")
    );

    log::debug!("[Feed] Connecting change feed: {ws_url}");

    let mut request = ws_url
        .into_client_request()
        .map_err(|e| FeedError::Connect(format!("invalid URL: {e}")))?;

    let origin = server_url
        .parse()
        .map_err(|e| FeedError::Connect(format!("invalid server URL '{server_url}': {e}")))?;
    request.headers_mut().insert("Origin", origin);
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {api_key}")
            .parse()
            .map_err(|e| FeedError::Connect(format!("unusable api key header: {e}")))?,
    );

    let (ws_stream, _) = connect_async(request)
        .await
        .map_err(|e| FeedError::Connect(format!("WebSocket connect failed: {e}")))?;

    let (mut write, mut read) = ws_stream.split();

    // Wait for welcome
    let welcome = tokio::time::timeout(FEED_WELCOME_TIMEOUT, async {
        while let Some(msg) = read.next().await {
            if let Ok(Message::Text(text)) = msg {
                if let Ok(frame) = serde_json::from_str::<IncomingFrame>(&text) {
                    if frame.frame_type.as_deref() == Some("welcome") {
                        return Ok(());
                    }
                }
            }
        }
        Err(FeedError::Connect("WebSocket closed before welcome".into()))
    })
    .await;

    match welcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(FeedError::Connect("Timeout waiting for welcome".into())),
    }

    // One binding per account; the topic filter carries a single
    // predicate, so already-read inserts are dropped at decode time
    // instead of in a second server-side binding.
    let topic = FeedTopic {
        channel: "ChangeFeedChannel".to_string(),
        schema: "public".to_string(),
        table: "notifications".to_string(),
        filter: format!("account=eq.{account}"),
    };
    let identifier = serde_json::to_string(&topic)
        .map_err(|e| FeedError::Connect(format!("topic serialization failed: {e}")))?;

    let subscribe = FeedFrame {
        command: "subscribe".to_string(),
        identifier,
        data: None,
    };
    let frame = serde_json::to_string(&subscribe)
        .map_err(|e| FeedError::Connect(format!("frame serialization failed: {e}")))?;

    write
        .send(Message::Text(frame))
        .await
        .map_err(|e| FeedError::Connect(format!("subscribe failed: {e}")))?;

    log::info!("[Feed] Subscribed to notification changes for account {account}");

    Ok((write, read))
}

/// Forwards change frames until disconnect.
///
/// Returns `true` if the subscriber is gone (stop reconnecting),
/// `false` on any connection-level exit (reconnect).
async fn run_stream(
    account: &AccountId,
    mut write: WsWrite,
    mut read: WsRead,
    events: &mpsc::Sender<FeedEvent>,
) -> bool {
    let mut last_activity = Instant::now();
    let mut health_interval = tokio::time::interval(FEED_HEALTH_CHECK_INTERVAL);

    loop {
        tokio::select! {
            Some(msg) = read.next() => {
                last_activity = Instant::now();

                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_change(&text) {
                            if events.send(event).await.is_err() {
                                log::debug!("[Feed] Subscriber for account {account} gone");
                                return true;
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            log::warn!("[Feed] Failed to answer ping");
                            return false;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        log::info!("[Feed] Change feed closed by server");
                        return false;
                    }
                    Err(e) => {
                        log::error!("[Feed] WebSocket error: {e}");
                        return false;
                    }
                    _ => {}
                }
            }

            _ = health_interval.tick() => {
                if last_activity.elapsed() > FEED_STALE_TIMEOUT {
                    log::warn!(
                        "[Feed] Connection stale ({}s), reconnecting",
                        last_activity.elapsed().as_secs()
                    );
                    return false;
                }
            }

            () = events.closed() => {
                log::debug!("[Feed] Subscriber for account {account} gone, closing stream");
                return true;
            }
        }
    }
}

/// Decodes one text frame into a feed event, if it carries one.
///
/// Protocol frames (welcome, ping, confirmations) and rows that arrive
/// already read produce nothing.
fn parse_change(text: &str) -> Option<FeedEvent> {
    let frame: IncomingFrame = serde_json::from_str(text).ok()?;
    match frame.frame_type.as_deref() {
        Some("welcome" | "ping" | "confirm_subscription") => return None,
        Some("reject_subscription") => {
            log::error!("[Feed] Subscription rejected by server");
            return None;
        }
        _ => {}
    }

    let payload: ChangePayload = serde_json::from_value(frame.message?).ok()?;
    match payload.event.as_str() {
        "insert" => {
            // Rows born read exist after imports; nothing to observe
            if payload.record.read {
                None
            } else {
                Some(FeedEvent::Insert(payload.record))
            }
        }
        "update" => Some(FeedEvent::Update(payload.record)),
        other => {
            log::debug!("[Feed] Ignoring change event kind: {other}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change_frame(event: &str, read: bool) -> String {
        json!({
            "identifier": "{\"channel\":\"ChangeFeedChannel\"}",
            "message": {
                "event": event,
                "record": {
                    "id": 7,
                    "account": "acct-1",
                    "title": "Pour scheduled",
                    "message": "Slab pour moved to 07:00",
                    "category": "warning",
                    "source": "order",
                    "source_id": 12,
                    "read": read,
                    "created_at": "2026-03-01T06:00:00Z",
                    "updated_at": "2026-03-01T06:00:00Z",
                }
            }
        })
        .to_string()
    }

    #[test]
    fn test_parse_change_event_kinds() {
        match parse_change(&change_frame("insert", false)) {
            Some(FeedEvent::Insert(record)) => {
                assert_eq!(record.id.0, 7);
                assert!(!record.read);
            }
            other => panic!("expected insert, got {other:?}"),
        }

        assert!(matches!(
            parse_change(&change_frame("update", true)),
            Some(FeedEvent::Update(_))
        ));
        assert!(parse_change(&change_frame("delete", false)).is_none());
    }

    #[test]
    fn test_already_read_inserts_are_dropped() {
        assert!(parse_change(&change_frame("insert", true)).is_none());
    }

    #[test]
    fn test_protocol_frames_produce_no_events() {
        assert!(parse_change(r#"{"type":"welcome"}"#).is_none());
        assert!(parse_change(r#"{"type":"ping","message":1693}"#).is_none());
        assert!(
            parse_change(r#"{"type":"confirm_subscription","identifier":"{}"}"#).is_none()
        );
        assert!(parse_change("not json at all").is_none());
    }

    #[test]
    fn test_subscribe_topic_carries_account_filter() {
        let topic = FeedTopic {
            channel: "ChangeFeedChannel".to_string(),
            schema: "public".to_string(),
            table: "notifications".to_string(),
            filter: format!("account=eq.{}", AccountId::from("acct-1")),
        };
        let identifier = serde_json::to_string(&topic).unwrap();

        let parsed: FeedTopic = serde_json::from_str(&identifier).unwrap();
        assert_eq!(parsed.table, "notifications");
        assert_eq!(parsed.filter, "account=eq.acct-1");
    }

    #[tokio::test]
    async fn test_unusable_feed_url_is_refused_up_front() {
        let feed = RealtimeFeed::new("ftp://backend.example.com", "key");
        let err = feed
            .subscribe(&AccountId::from("acct-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Connect(_)));
    }
}
