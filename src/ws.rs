//! One long-lived, auto-reconnecting multiplexed WebSocket connection to
//! the exchange combined-stream endpoint. Accepts SUBSCRIBE/UNSUBSCRIBE
//! control frames from the caller at runtime, in addition to the streams
//! it was opened with.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessageFrame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::reactive::Subject;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(300);
const PONG_TIMEOUT: Duration = Duration::from_secs(30);

/// A decoded data frame: `{stream: "{symbol}@{channel}"}` split into its
/// parts, with `data` holding the *entire* parsed envelope (including the
/// `stream` key) so the on-disk record preserves the stream identifier.
#[derive(Debug, Clone)]
pub struct WsDataMessage {
    pub symbol: String,
    pub channel: String,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub enum WsEvent {
    Connected,
    Disconnected,
    ControlMessage { id: u64 },
}

enum Outbound {
    Send(Value),
    Close,
}

/// One multiplexed connection. Owns its background task; upward
/// notification is via the `messages`/`events` subjects only, never a
/// back-pointer from the connection into its owner.
pub struct WebSocketConnection {
    messages: Subject<WsDataMessage>,
    events: Subject<WsEvent>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl WebSocketConnection {
    /// Opens a connection to `url` (expected to already carry the
    /// bootstrap/default pair's streams in its query string) and starts
    /// its reconnecting background task.
    pub fn connect(url: Url) -> Self {
        let messages = Subject::new();
        let events = Subject::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let task_messages = messages.clone();
        let task_events = events.clone();
        tokio::spawn(run(url, task_messages, task_events, outbound_rx));

        Self {
            messages,
            events,
            outbound: outbound_tx,
        }
    }

    pub fn messages(&self) -> Subject<WsDataMessage> {
        self.messages.clone()
    }

    pub fn events(&self) -> Subject<WsEvent> {
        self.events.clone()
    }

    /// Encodes `value` as JSON and sends it as a text frame. If no
    /// transport is currently attached (mid-reconnect) the send is
    /// silently dropped, per spec: callers must rely on a later
    /// CONTROL_MESSAGE ack, not on delivery of this call.
    pub fn send_message(&self, value: Value) {
        let _ = self.outbound.send(Outbound::Send(value));
    }

    /// Graceful shutdown: disables reconnect and sends a close frame
    /// (code 1000).
    pub fn shutdown(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

async fn run(
    url: Url,
    messages: Subject<WsDataMessage>,
    events: Subject<WsEvent>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut backoff = INITIAL_BACKOFF;

    'reconnect: loop {
        let stream = match connect_async(url.clone()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                warn!("websocket connect failed: {e}, retrying in {backoff:?}");
                sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue 'reconnect;
            }
        };
        backoff = INITIAL_BACKOFF;
        enable_tcp_keepalive(&stream);

        let _ = events.next(WsEvent::Connected);
        info!("websocket connected: {url}");

        let mut stream = stream;
        let mut ping_timer = interval(PING_INTERVAL);
        ping_timer.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    if send_ping_and_await_pong(&mut stream).await.is_err() {
                        warn!("ping/pong timeout, reconnecting");
                        break;
                    }
                }
                cmd = outbound.recv() => {
                    match cmd {
                        Some(Outbound::Send(value)) => {
                            let text = serde_json::to_string(&value).unwrap_or_default();
                            if stream.send(WsMessageFrame::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Close) => {
                            let _ = stream.send(WsMessageFrame::Close(None)).await;
                            let _ = events.next(WsEvent::Disconnected);
                            return;
                        }
                        None => return,
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessageFrame::Text(text))) => {
                            handle_text_frame(&text, &messages, &events);
                        }
                        Some(Ok(WsMessageFrame::Ping(payload))) => {
                            let _ = stream.send(WsMessageFrame::Pong(payload)).await;
                        }
                        Some(Ok(WsMessageFrame::Binary(_))) => {
                            // Binary frames carry no protocol meaning here; ignored.
                        }
                        Some(Ok(WsMessageFrame::Close(_))) | None => {
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("websocket read error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        let _ = events.next(WsEvent::Disconnected);
        sleep(backoff).await;
    }
}

async fn send_ping_and_await_pong(
    stream: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> Result<(), ()> {
    if stream
        .send(WsMessageFrame::Ping(Vec::new()))
        .await
        .is_err()
    {
        return Err(());
    }
    match timeout(PONG_TIMEOUT, async {
        loop {
            match stream.next().await {
                Some(Ok(WsMessageFrame::Pong(_))) => return Ok(()),
                Some(Ok(_)) => continue,
                _ => return Err(()),
            }
        }
    })
    .await
    {
        Ok(inner) => inner,
        Err(_) => Err(()),
    }
}

fn handle_text_frame(text: &str, messages: &Subject<WsDataMessage>, events: &Subject<WsEvent>) {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("could not decode frame, dropping: {e}");
            return;
        }
    };

    if let Some(stream_id) = parsed.get("stream").and_then(Value::as_str) {
        let mut parts = stream_id.split('@');
        let symbol = parts.next().unwrap_or_default().to_string();
        let channel = parts.next().unwrap_or_default().to_string();
        let _ = messages.next(WsDataMessage {
            symbol,
            channel,
            data: parsed,
        });
    } else if parsed.get("result").map(Value::is_null).unwrap_or(false) {
        if let Some(id) = parsed.get("id").and_then(Value::as_u64) {
            let _ = events.next(WsEvent::ControlMessage { id });
        }
    } else {
        warn!("unexpected websocket message: {parsed}");
    }
}

#[cfg(unix)]
fn enable_tcp_keepalive(stream: &WebSocketStream<MaybeTlsStream<TcpStream>>) {
    use std::os::unix::io::{AsRawFd, FromRawFd};

    let tcp = match stream.get_ref() {
        MaybeTlsStream::Plain(tcp) => tcp,
        _ => return,
    };
    // Borrow the fd without taking ownership: `socket2::Socket` would
    // close it on drop, so we `forget` it once the keepalive option is
    // applied and leave the fd owned by tokio's `TcpStream` as before.
    let socket = unsafe { socket2::Socket::from_raw_fd(tcp.as_raw_fd()) };
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("failed to set TCP keepalive: {e}");
    }
    std::mem::forget(socket);
}

#[cfg(not(unix))]
fn enable_tcp_keepalive(_stream: &WebSocketStream<MaybeTlsStream<TcpStream>>) {}

/// Builds the combined-stream URL for a set of `symbol@channel` stream
/// names, e.g. `btcusdt@trade`, `btcusdt@depth@100ms`.
pub fn combined_stream_url(streams: &[String]) -> Url {
    let query = format!("streams={}", streams.join("/"));
    let mut url = Url::parse("wss://stream.binance.com:9443/stream").expect("valid base url");
    url.set_query(Some(&query));
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_stream_url_joins_with_slash() {
        let url = combined_stream_url(&[
            "btcusdt@trade".to_string(),
            "btcusdt@depth@100ms".to_string(),
        ]);
        assert_eq!(
            url.as_str(),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@trade/btcusdt@depth@100ms"
        );
    }

    #[test]
    fn handle_text_frame_emits_message_for_stream_payload() {
        let messages = Subject::new();
        let events = Subject::new();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let s = seen.clone();
        let _sub = messages.subscribe(crate::reactive::Observer::on_next(move |m: &WsDataMessage| {
            *s.lock().unwrap() = Some((m.symbol.clone(), m.channel.clone()));
        }));
        handle_text_frame(
            r#"{"stream":"btcusdt@trade","data":{"p":"1"}}"#,
            &messages,
            &events,
        );
        assert_eq!(
            *seen.lock().unwrap(),
            Some(("btcusdt".to_string(), "trade".to_string()))
        );
    }

    #[test]
    fn handle_text_frame_emits_control_message_for_ack() {
        let messages = Subject::new();
        let events = Subject::new();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let s = seen.clone();
        let _sub = events.subscribe(crate::reactive::Observer::on_next(move |e: &WsEvent| {
            if let WsEvent::ControlMessage { id } = e {
                *s.lock().unwrap() = Some(*id);
            }
        }));
        handle_text_frame(r#"{"result":null,"id":7}"#, &messages, &events);
        assert_eq!(*seen.lock().unwrap(), Some(7));
    }

    #[test]
    fn handle_text_frame_drops_decode_failures() {
        let messages = Subject::new();
        let events = Subject::new();
        handle_text_frame("not json", &messages, &events);
    }
}
