//! Event bus registry and the websocket connection that feeds it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use backend_core::{PushEvent, PushEventKind, ReconnectBackoff, decode_frame};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::api::ConversationService;

pub type PushHandler = Arc<dyn Fn(&PushEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<PushEventKind, Vec<(SubscriptionId, PushHandler)>>,
}

/// Listener registry keyed by push event kind.
///
/// Frames are validated into [`PushEvent`] before any handler sees them;
/// malformed frames are logged and dropped.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: PushEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(%kind, "push handler subscribed");
        id
    }

    /// Remove one handler. Returns whether it was registered for `kind`.
    pub fn unsubscribe(&self, kind: PushEventKind, id: SubscriptionId) -> bool {
        let mut registry = self.registry();
        let Some(handlers) = registry.handlers.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        before != handlers.len()
    }

    pub fn handler_count(&self, kind: PushEventKind) -> usize {
        self.registry().handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Decode a raw text frame and dispatch it.
    pub fn dispatch_frame(&self, frame: &str) -> Option<PushEventKind> {
        match decode_frame(frame) {
            Ok(event) => {
                self.dispatch(&event);
                Some(event.kind())
            }
            Err(err) => {
                warn!(error = %err, "dropping malformed push frame");
                None
            }
        }
    }

    /// Deliver an event to every handler of its kind. Returns the handler count.
    pub fn dispatch(&self, event: &PushEvent) -> usize {
        let handlers: Vec<PushHandler> = self
            .registry()
            .handlers
            .get(&event.kind())
            .map(|handlers| handlers.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connectivity update published by the push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushLinkState {
    pub connected: bool,
    pub retry_in: Option<Duration>,
}

enum LinkEnd {
    /// Shutdown requested or the session ended.
    Stopped,
    /// Connection failed or dropped; reconnect after backoff.
    Lost,
}

type PushStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket client that keeps the push channel connected.
pub struct PushConnection {
    url: Url,
    service: Arc<dyn ConversationService>,
    bus: EventBus,
    backoff: ReconnectBackoff,
    status_tx: mpsc::UnboundedSender<PushLinkState>,
}

impl PushConnection {
    pub fn new(
        url: Url,
        service: Arc<dyn ConversationService>,
        bus: EventBus,
        backoff: ReconnectBackoff,
        status_tx: mpsc::UnboundedSender<PushLinkState>,
    ) -> Self {
        Self {
            url,
            service,
            bus,
            backoff,
            status_tx,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Connect, pump frames into the bus and reconnect with backoff until
    /// `shutdown` fires or the session expires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut expired = self.service.subscribe_expired();

        loop {
            if shutdown.is_cancelled() || *expired.borrow_and_update() {
                break;
            }

            match self.connect_once(&shutdown, &mut expired).await {
                LinkEnd::Stopped => break,
                LinkEnd::Lost => {}
            }

            let delay = self.backoff.next_delay(None);
            debug!(
                attempt = self.backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "push channel reconnect scheduled"
            );
            self.report(false, Some(delay));

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = expired.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("push channel stopped");
        self.report(false, None);
    }

    async fn connect_once(
        &mut self,
        shutdown: &CancellationToken,
        expired: &mut watch::Receiver<bool>,
    ) -> LinkEnd {
        let token = match self.service.push_credential().await {
            Ok(token) => token,
            Err(err) if err.is_auth() => {
                debug!(code = %err.code, "no credential for push channel");
                return LinkEnd::Stopped;
            }
            Err(err) => {
                warn!(code = %err.code, message = %err.message, "push credential unavailable");
                return LinkEnd::Lost;
            }
        };

        let url = url_with_token(&self.url, &token);
        let connected = tokio::select! {
            _ = shutdown.cancelled() => return LinkEnd::Stopped,
            result = connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((stream, _response)) => {
                info!(host = self.url.host_str().unwrap_or_default(), "push channel connected");
                self.backoff.reset();
                self.report(true, None);
                self.pump(stream, shutdown, expired).await
            }
            Err(tungstenite::Error::Http(response)) if response.status().as_u16() == 401 => {
                info!("push handshake unauthorized; renewing credential");
                self.renew_rejected(&token).await
            }
            Err(err) => {
                warn!(error = %err, "push channel connect failed");
                LinkEnd::Lost
            }
        }
    }

    /// The next attempt picks up the renewed credential; a rejected renewal has
    /// already ended the session.
    async fn renew_rejected(&self, stale: &str) -> LinkEnd {
        match self.service.renew_push_credential(stale).await {
            Ok(_) => LinkEnd::Lost,
            Err(err) if err.is_auth() => {
                debug!(code = %err.code, "push credential renewal rejected");
                LinkEnd::Stopped
            }
            Err(err) => {
                warn!(code = %err.code, message = %err.message, "push credential renewal failed");
                LinkEnd::Lost
            }
        }
    }

    async fn pump(
        &self,
        stream: PushStream,
        shutdown: &CancellationToken,
        expired: &mut watch::Receiver<bool>,
    ) -> LinkEnd {
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return LinkEnd::Stopped;
                }
                changed = expired.changed() => {
                    if changed.is_err() || *expired.borrow_and_update() {
                        let _ = write.send(Message::Close(None)).await;
                        return LinkEnd::Stopped;
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.bus.dispatch_frame(text.as_str());
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            return LinkEnd::Lost;
                        }
                    }
                    Some(Ok(Message::Close(reason))) => {
                        info!(?reason, "push channel closed by server");
                        return LinkEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "push channel read failed");
                        return LinkEnd::Lost;
                    }
                    None => return LinkEnd::Lost,
                },
            }
        }
    }

    fn report(&self, connected: bool, retry_in: Option<Duration>) {
        let _ = self.status_tx.send(PushLinkState {
            connected,
            retry_in,
        });
    }
}

/// Push URL carrying the access credential as the `token` query parameter.
pub fn url_with_token(url: &Url, token: &str) -> Url {
    let mut url = url.clone();
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "token")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        pairs.extend_pairs(retained);
        pairs.append_pair("token", token);
    }
    url
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use backend_core::IncomingMessageEvent;
    use tokio::net::TcpListener;

    use super::*;
    use crate::testing::FakeService;

    const MESSAGE_FRAME: &str = r#"{
        "event": "message:received",
        "data": {
            "conversationId": "c1",
            "messageId": "m1",
            "senderId": "u2",
            "content": "hello",
            "type": "text",
            "createdAt": 2
        }
    }"#;

    #[test]
    fn dispatches_only_to_matching_kind() {
        let bus = EventBus::new();
        let received = Arc::new(AtomicUsize::new(0));
        let offline = Arc::new(AtomicUsize::new(0));

        let counter = received.clone();
        bus.subscribe(PushEventKind::MessageReceived, move |event| {
            assert!(matches!(event, PushEvent::MessageReceived(_)));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = offline.clone();
        bus.subscribe(PushEventKind::UserOffline, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(
            bus.dispatch_frame(MESSAGE_FRAME),
            Some(PushEventKind::MessageReceived)
        );
        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(offline.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = bus.subscribe(PushEventKind::UserOnline, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let online = PushEvent::UserOnline {
            user_id: "u2".to_owned(),
        };
        assert_eq!(bus.dispatch(&online), 1);
        assert!(bus.unsubscribe(PushEventKind::UserOnline, id));
        assert!(!bus.unsubscribe(PushEventKind::UserOnline, id));
        assert_eq!(bus.dispatch(&online), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(PushEventKind::UserOnline), 0);
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.subscribe(PushEventKind::MessageReceived, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.dispatch_frame("not json"), None);
        assert_eq!(bus.dispatch_frame(r#"{"event":"typing:start","data":{}}"#), None);
        assert_eq!(
            bus.dispatch_frame(r#"{"event":"message:received","data":{"messageId":"m1"}}"#),
            None
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn token_query_parameter_replaces_previous_value() {
        let url = Url::parse("wss://chat.example.org/ws?v=2&token=old").expect("url");
        let with_token = url_with_token(&url, "a b");
        assert_eq!(with_token.as_str(), "wss://chat.example.org/ws?v=2&token=a+b");
    }

    #[tokio::test]
    async fn connection_feeds_bus_and_reports_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(socket)
                .await
                .expect("handshake");
            ws.send(Message::Text("{broken".into()))
                .await
                .expect("send malformed");
            ws.send(Message::Text(MESSAGE_FRAME.into()))
                .await
                .expect("send frame");
            // Hold the socket open until the client goes away.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let service = FakeService::new();
        let bus = EventBus::new();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<IncomingMessageEvent>();
        bus.subscribe(PushEventKind::MessageReceived, move |event| {
            if let PushEvent::MessageReceived(message) = event {
                let _ = event_tx.send(message.clone());
            }
        });

        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let url = Url::parse(&format!("ws://{address}/ws")).expect("push url");
        let shutdown = CancellationToken::new();
        let task = PushConnection::new(
            url,
            service.clone(),
            bus,
            ReconnectBackoff::new(Duration::from_millis(10), Duration::from_millis(50)),
            status_tx,
        )
        .spawn(shutdown.clone());

        let status = tokio::time::timeout(Duration::from_secs(5), status_rx.recv())
            .await
            .expect("status in time")
            .expect("status sender alive");
        assert!(status.connected);

        let message = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .expect("event in time")
            .expect("bus handler alive");
        assert_eq!(message.conversation_id, "c1");
        assert_eq!(message.message_id, "m1");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("push task stops")
            .expect("push task joins");
        server.abort();
    }

    #[tokio::test]
    async fn connection_stops_when_session_expires() {
        let service = FakeService::new();
        service.expire();

        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let task = PushConnection::new(
            Url::parse("ws://127.0.0.1:9/ws").expect("push url"),
            service.clone(),
            EventBus::new(),
            ReconnectBackoff::default(),
            status_tx,
        )
        .spawn(CancellationToken::new());

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("push task stops")
            .expect("push task joins");
        let last = status_rx.recv().await.expect("final status");
        assert_eq!(
            last,
            PushLinkState {
                connected: false,
                retry_in: None
            }
        );
    }

    #[tokio::test]
    async fn unauthorized_handshake_renews_credential_before_reconnecting() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        let (uri_tx, mut uri_rx) = mpsc::unbounded_channel::<String>();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = socket.read(&mut buf).await.expect("read request");
                if read == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..read]);
            }
            socket
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .expect("write 401");
            socket.shutdown().await.expect("shutdown");

            let (socket, _) = listener.accept().await.expect("accept again");
            let record_uri =
                move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    let _ = uri_tx.send(request.uri().to_string());
                    Ok(response)
                };
            let mut ws = tokio_tungstenite::accept_hdr_async(socket, record_uri)
                .await
                .expect("handshake");
            ws.send(Message::Text(MESSAGE_FRAME.into()))
                .await
                .expect("send frame");
            while let Some(Ok(_)) = ws.next().await {}
        });

        let service = FakeService::new();
        let bus = EventBus::new();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();
        bus.subscribe(PushEventKind::MessageReceived, move |event| {
            if let PushEvent::MessageReceived(message) = event {
                let _ = event_tx.send(message.message_id.clone());
            }
        });

        let (status_tx, _status_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = PushConnection::new(
            Url::parse(&format!("ws://{address}/ws")).expect("push url"),
            service.clone(),
            bus,
            ReconnectBackoff::new(Duration::from_millis(10), Duration::from_millis(50)),
            status_tx,
        )
        .spawn(shutdown.clone());

        let message_id = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .expect("event in time")
            .expect("bus handler alive");
        assert_eq!(message_id, "m1");
        assert_eq!(service.push_renewals(), vec!["a1".to_owned()]);
        assert_eq!(uri_rx.recv().await.as_deref(), Some("/ws?token=a2"));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("push task stops")
            .expect("push task joins");
        server.abort();
    }

    #[tokio::test]
    async fn rejected_push_renewal_stops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        let service = FakeService::new();
        let expiring = service.clone();
        let server = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};

            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            // The renewal token is refused as well.
            expiring.expire();
            let _ = socket
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n")
                .await;
            let _ = socket.shutdown().await;
        });

        let (status_tx, _status_rx) = mpsc::unbounded_channel();
        let task = PushConnection::new(
            Url::parse(&format!("ws://{address}/ws")).expect("push url"),
            service.clone(),
            EventBus::new(),
            ReconnectBackoff::new(Duration::from_millis(10), Duration::from_millis(50)),
            status_tx,
        )
        .spawn(CancellationToken::new());

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("push task stops")
            .expect("push task joins");
        assert!(service.push_renewals().is_empty());
        server.abort();
    }
}
