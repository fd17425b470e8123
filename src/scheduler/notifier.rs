//! Push channel from the scheduler
//!
//! The scheduler pushes [`TaskNotification`]s as JSON text frames over a
//! websocket opened with the worker's bearer token. The feed reconnects after
//! `retry_delay` whenever the connection drops, and announces every
//! reconnection: notifications sent while disconnected are lost and the
//! driver has to recover them.

use super::SchedulerClient;
use crate::error::SchedulerError;
use crate::task::TaskNotification;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub const NOTIFICATIONS_PATH: &str = "/notifications";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the push channel hands to the worker driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Notification(TaskNotification),
    /// Channel re-established after a drop
    Reconnected,
}

pub struct NotificationFeed {
    scheduler: Arc<SchedulerClient>,
    url: String,
    retry_delay: Duration,
}

impl NotificationFeed {
    pub fn new(scheduler: Arc<SchedulerClient>, url: &str, retry_delay: Duration) -> Self {
        Self {
            scheduler,
            url: url.to_string(),
            retry_delay,
        }
    }

    /// Feed served by the scheduler itself
    pub fn for_scheduler(scheduler: Arc<SchedulerClient>, retry_delay: Duration) -> Self {
        let url = websocket_url(scheduler.scheduler_url());
        Self::new(scheduler, &url, retry_delay)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Forward notifications until nobody listens to `events` anymore
    pub async fn run(self, events: mpsc::Sender<SchedulerEvent>) {
        let mut connected_before = false;
        while !events.is_closed() {
            match self.connect().await {
                Ok(stream) => {
                    info!("Listening to scheduler notifications [url:{}]", self.url);
                    if connected_before && events.send(SchedulerEvent::Reconnected).await.is_err() {
                        return;
                    }
                    connected_before = true;
                    if !forward(stream, &events).await {
                        return;
                    }
                    warn!(
                        "Scheduler notifications closed, reconnecting in {:?}",
                        self.retry_delay
                    );
                }
                Err(e) => warn!(
                    "Cannot open scheduler notifications, retrying in {:?} [url:{}]: {}",
                    self.retry_delay, self.url, e
                ),
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn connect(&self) -> Result<WsStream, SchedulerError> {
        let token = self.scheduler.bearer_token().await?;
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SchedulerError::Unreachable(e.to_string()))?;
        let token = HeaderValue::from_str(&token)
            .map_err(|_| SchedulerError::Login("token is not a valid header".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, token);

        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => Ok(stream),
            Err(WsError::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                self.scheduler.expire_token().await;
                Err(SchedulerError::Unauthorized)
            }
            Err(e) => Err(SchedulerError::Unreachable(e.to_string())),
        }
    }
}

/// Pump one connection; `false` once the receiver is gone
async fn forward(mut stream: WsStream, events: &mpsc::Sender<SchedulerEvent>) -> bool {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("Scheduler notifications failed: {}", e);
                break;
            }
        };
        let Some(notification) = decode(&text) else {
            continue;
        };
        debug!(
            "Notification received [chainTaskId:{}]",
            notification.chain_task_id()
        );
        if events
            .send(SchedulerEvent::Notification(notification))
            .await
            .is_err()
        {
            return false;
        }
    }
    true
}

/// Malformed frames are logged and dropped
pub fn decode(text: &str) -> Option<TaskNotification> {
    match serde_json::from_str(text) {
        Ok(notification) => Some(notification),
        Err(e) => {
            warn!("Ignoring malformed notification: {}", e);
            None
        }
    }
}

/// `http(s)://host/base` to `ws(s)://host/base/notifications`
pub fn websocket_url(scheduler_url: &str) -> String {
    let base = scheduler_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}{}", base, NOTIFICATIONS_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Credentials;
    use crate::scheduler::CoreClient;
    use futures::SinkExt;
    use httpmock::prelude::*;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    const WORKER_KEY: &str = "0x2a46e8c1535792f6689b10d5c882c9363910c30751ec193ae71ec71630077909";

    fn scheduler(server: &MockServer) -> Arc<SchedulerClient> {
        let core = CoreClient::new(&server.base_url(), Duration::from_secs(5)).unwrap();
        let credentials = Arc::new(Credentials::from_private_key(WORKER_KEY).unwrap());
        Arc::new(SchedulerClient::new(core, credentials, Duration::from_millis(10)))
    }

    fn mock_login(server: &MockServer) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(GET).path("/workers/challenge");
            then.status(200).body("abc");
        });
        server.mock(|when, then| {
            when.method(POST).path("/workers/login");
            then.status(200).body("jwt");
        })
    }

    fn upload(chain_task_id: &str) -> TaskNotification {
        TaskNotification::PleaseUpload {
            chain_task_id: chain_task_id.to_string(),
        }
    }

    /// Websocket server running `script(connection_index, ws)` per connection,
    /// recording the `Authorization` header of every handshake
    async fn push_server<F, Fut>(script: F) -> (String, Arc<Mutex<Vec<String>>>)
    where
        F: Fn(usize, Option<WebSocketStream<TcpStream>>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}{}", listener.local_addr().unwrap(), NOTIFICATIONS_PATH);
        let headers = Arc::new(Mutex::new(Vec::new()));
        let seen = headers.clone();
        tokio::spawn(async move {
            let mut index = 0;
            while let Ok((tcp, _)) = listener.accept().await {
                let seen = seen.clone();
                let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    let auth = request
                        .headers()
                        .get(AUTHORIZATION)
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    seen.lock().push(auth);
                    Ok(response)
                };
                let ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await.ok();
                tokio::spawn(script(index, ws));
                index += 1;
            }
        });
        (url, headers)
    }

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("https://scheduler.iex.ec/"),
            "wss://scheduler.iex.ec/notifications"
        );
        assert_eq!(
            websocket_url("http://localhost:13000"),
            "ws://localhost:13000/notifications"
        );
    }

    #[test]
    fn test_decode() {
        let json = serde_json::to_string(&upload("0x1")).unwrap();
        assert_eq!(decode(&json), Some(upload("0x1")));
        assert_eq!(decode("not json"), None);
    }

    #[tokio::test]
    async fn test_forwards_notifications_and_reconnects() {
        let server = MockServer::start();
        mock_login(&server);
        let (url, headers) = push_server(|index, ws| async move {
            let Some(mut ws) = ws else { return };
            if index == 0 {
                let json = serde_json::to_string(&upload("0x1")).unwrap();
                ws.send(Message::text(json)).await.unwrap();
                ws.send(Message::text("not json")).await.unwrap();
                let _ = ws.close(None).await;
            } else {
                let json = serde_json::to_string(&upload("0x2")).unwrap();
                ws.send(Message::text(json)).await.unwrap();
                while ws.next().await.is_some() {}
            }
        })
        .await;

        let (tx, mut rx) = mpsc::channel(8);
        let feed = NotificationFeed::new(scheduler(&server), &url, Duration::from_millis(10));
        let handle = tokio::spawn(feed.run(tx));

        let mut events = Vec::new();
        while events.len() < 3 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                SchedulerEvent::Notification(upload("0x1")),
                SchedulerEvent::Reconnected,
                SchedulerEvent::Notification(upload("0x2")),
            ]
        );

        assert!(headers.lock().iter().all(|auth| auth == "Bearer jwt"));
        handle.abort();
    }

    #[tokio::test]
    async fn test_rejected_handshake_logs_in_again() {
        let server = MockServer::start();
        let login = mock_login(&server);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}{}", listener.local_addr().unwrap(), NOTIFICATIONS_PATH);
        tokio::spawn(async move {
            let mut first = true;
            while let Ok((tcp, _)) = listener.accept().await {
                let reject = first;
                first = false;
                let callback = move |_: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    if reject {
                        let mut denied = ErrorResponse::new(None);
                        *denied.status_mut() = StatusCode::UNAUTHORIZED;
                        return Err(denied);
                    }
                    Ok(response)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
                    continue;
                };
                tokio::spawn(async move {
                    let json = serde_json::to_string(&upload("0x3")).unwrap();
                    let _ = ws.send(Message::text(json)).await;
                    while ws.next().await.is_some() {}
                });
            }
        });

        let (tx, mut rx) = mpsc::channel(8);
        let feed = NotificationFeed::new(scheduler(&server), &url, Duration::from_millis(10));
        let handle = tokio::spawn(feed.run(tx));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(SchedulerEvent::Notification(upload("0x3"))));
        login.assert_hits(2);
        handle.abort();
    }
}
