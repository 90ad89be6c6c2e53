use std::future::Future;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

use super::envelope::Event;
use super::subscription::SubscriptionSet;
use super::{HandshakeError, StreamError, is_closed_transport};

pub const EVENTS_PATH: &str = "/v1/ws";

const SUBSCRIPTIONS_SET: &str = "subscriptions.set";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One websocket session with the event stream.
///
/// Writes and reads sit behind separate locks, so a subscription update can
/// be sent while another task is blocked in [`Connection::receive_event`].
pub struct Connection {
    writer: Mutex<Option<SplitSink<WsStream, WsMessage>>>,
    reader: Mutex<Option<SplitStream<WsStream>>>,
}

#[derive(Serialize)]
struct SubscriptionMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "requestID")]
    request_id: &'a str,
    #[serde(rename = "chatIDs")]
    chat_ids: &'a [String],
}

impl Connection {
    /// A handle with no session behind it. Every operation except
    /// [`Connection::close`] fails with [`StreamError::NotInitialized`].
    #[cfg(test)]
    pub fn unopened() -> Self {
        Self {
            writer: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    pub async fn open(base_url: &str, token: &str, handshake_timeout: Duration) -> Result<Self, StreamError> {
        let url = stream_url(base_url)?;
        let mut request = url.as_str().into_client_request()?;
        let authorization =
            HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| StreamError::InvalidToken)?;
        request.headers_mut().insert(header::AUTHORIZATION, authorization);

        debug!(%url, "opening event stream");
        let (ws, response) = match timeout(handshake_timeout, connect_async(request)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(tungstenite::Error::Http(response))) => {
                let body = response
                    .body()
                    .as_deref()
                    .filter(|body| !body.is_empty())
                    .map(|body| String::from_utf8_lossy(body).into_owned());
                return Err(StreamError::Handshake(HandshakeError {
                    status: Some(response.status().as_u16()),
                    body,
                }));
            }
            Ok(Err(error)) => return Err(error.into()),
            Err(_) => return Err(StreamError::Timeout("handshake")),
        };
        debug!(status = response.status().as_u16(), "event stream handshake complete");

        let (writer, reader) = ws.split();
        Ok(Self {
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Replaces the server-side subscription set. Returns the request id the
    /// server will echo in its `subscriptions.updated` acknowledgment.
    pub async fn set_subscriptions(
        &self,
        request_id: Option<&str>,
        subscriptions: &SubscriptionSet,
        deadline: Option<Instant>,
    ) -> Result<String, StreamError> {
        let request_id = request_id
            .map(str::to_string)
            .unwrap_or_else(new_request_id);
        let payload = serde_json::to_string(&SubscriptionMessage {
            kind: SUBSCRIPTIONS_SET,
            request_id: &request_id,
            chat_ids: subscriptions.chat_ids(),
        })?;

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(StreamError::NotInitialized)?;
        within(deadline, "subscription update", writer.send(WsMessage::Text(payload))).await??;
        Ok(request_id)
    }

    /// Waits for the next event. The deadline bounds this call only.
    pub async fn receive_event(&self, deadline: Option<Instant>) -> Result<Event, StreamError> {
        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or(StreamError::NotInitialized)?;

        loop {
            let message = within(deadline, "receive", reader.next())
                .await?
                .ok_or(StreamError::Closed {
                    code: None,
                    reason: String::new(),
                })??;

            match message {
                WsMessage::Text(text) => match Event::decode(&text) {
                    Ok(event) => return Ok(event),
                    Err(error) => warn!(%error, "skipping undecodable text frame"),
                },
                WsMessage::Binary(data) => match serde_json::from_slice::<Value>(&data) {
                    Ok(raw) => return Ok(Event::from_value(raw)),
                    Err(error) => warn!(%error, len = data.len(), "skipping undecodable binary frame"),
                },
                WsMessage::Close(frame) => {
                    let (code, reason) = frame
                        .map(|frame| (Some(u16::from(frame.code)), frame.reason.into_owned()))
                        .unwrap_or((None, String::new()));
                    return Err(StreamError::Closed { code, reason });
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            }
        }
    }

    /// Sends a close frame and releases the session. Calling it again, or on
    /// an unopened handle, does nothing.
    pub async fn close(&self) -> Result<(), StreamError> {
        let writer = self.writer.lock().await.take();
        self.reader.lock().await.take();
        let Some(mut writer) = writer else {
            return Ok(());
        };

        match timeout(CLOSE_TIMEOUT, writer.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) if is_closed_transport(&error) => Ok(()),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(StreamError::Timeout("close")),
        }
    }
}

/// Derives the websocket endpoint from the REST base URL.
pub fn stream_url(base_url: &str) -> Result<Url, StreamError> {
    let mut url = Url::parse(base_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(StreamError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| StreamError::UnsupportedScheme(url.scheme().to_string()))?;
    url.set_path(EVENTS_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

async fn within<F: Future>(
    deadline: Option<Instant>,
    stage: &'static str,
    future: F,
) -> Result<F::Output, StreamError> {
    match deadline {
        Some(deadline) => timeout_at(deadline, future)
            .await
            .map_err(|_| StreamError::Timeout(stage)),
        None => Ok(future.await),
    }
}

fn new_request_id() -> String {
    format!("sub-{:016x}", rand::random::<u64>())
}
