//! Session socket to the speech service.
//!
//! [`NetLink`] is the only owner of the socket. It runs the pure
//! [`SessionMachine`] and performs its actions: opening the socket, timers,
//! credential requests, and relaying service messages to the core loop.
//! Relays talk to the socket only through [`SessionSocket`].

pub mod backoff;
pub mod machine;
pub mod timer;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::config::Config;
use crate::credential::CredentialProvider;
use crate::protocol::{ClientEvent, SessionSettings};
use crate::state_machine::SessionState;
use backoff::{ReconnectPolicy, random_jitter};
use machine::{SessionAction, SessionEvent, SessionMachine};
use timer::Deadline;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("session socket is not connected")]
    NotConnected,
    #[error("session socket writer has shut down")]
    WriterClosed,
    #[error("gave up reconnecting after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// What the core loop hears from the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    Text(String),
    Connected,
    Disconnected,
    /// Relay state must go back to its initial values.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    SendFailed,
    Unauthorized,
}

#[derive(Debug)]
enum LinkCommand {
    Connect,
    Close,
    Shutdown,
    Reconnect(ReconnectReason),
}

/// The socket as the relays see it: read-only state plus a send method.
pub trait SessionSocket: Send + Sync {
    fn state(&self) -> SessionState;
    /// Bytes handed to the socket but not yet written to the transport.
    fn buffered_amount(&self) -> usize;
    fn send_text(&self, text: String) -> Result<(), LinkError>;
    fn request_reconnect(&self, reason: ReconnectReason);
}

struct Outbox {
    tx: mpsc::UnboundedSender<Message>,
    backlog: Arc<AtomicUsize>,
}

struct Shared {
    state: SessionState,
    outbox: Option<Outbox>,
}

/// Cloneable front of the link, handed to relays and the core loop.
pub struct LinkHandle {
    shared: Mutex<Shared>,
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    fn new(commands: mpsc::UnboundedSender<LinkCommand>) -> Self {
        Self {
            shared: Mutex::new(Shared {
                state: SessionState::Disconnected,
                outbox: None,
            }),
            commands,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        self.lock().state = state;
    }

    /// Queue the first message of a session ahead of any relay traffic,
    /// then let relays send.
    fn go_live(&self, first: String) -> Result<(), LinkError> {
        let mut shared = self.lock();
        shared.state = SessionState::Connected;
        let outbox = shared.outbox.as_ref().ok_or(LinkError::NotConnected)?;
        let len = first.len();
        outbox.backlog.fetch_add(len, Ordering::AcqRel);
        if outbox.tx.send(Message::Text(first.into())).is_err() {
            outbox.backlog.fetch_sub(len, Ordering::AcqRel);
            return Err(LinkError::WriterClosed);
        }
        Ok(())
    }

    fn install(&self, outbox: Outbox) {
        self.lock().outbox = Some(outbox);
    }

    fn clear_outbox(&self) {
        self.lock().outbox = None;
    }

    pub fn connect(&self) {
        let _ = self.commands.send(LinkCommand::Connect);
    }

    /// Tear the session down but keep the link alive for a later `connect`.
    pub fn close(&self) {
        let _ = self.commands.send(LinkCommand::Close);
    }

    /// Tear the session down and end the link task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(LinkCommand::Shutdown);
    }
}

impl SessionSocket for LinkHandle {
    fn state(&self) -> SessionState {
        self.lock().state
    }

    fn buffered_amount(&self) -> usize {
        self.lock()
            .outbox
            .as_ref()
            .map_or(0, |o| o.backlog.load(Ordering::Acquire))
    }

    fn send_text(&self, text: String) -> Result<(), LinkError> {
        let shared = self.lock();
        if shared.state != SessionState::Connected {
            return Err(LinkError::NotConnected);
        }
        let outbox = shared.outbox.as_ref().ok_or(LinkError::NotConnected)?;

        let len = text.len();
        outbox.backlog.fetch_add(len, Ordering::AcqRel);
        if outbox.tx.send(Message::Text(text.into())).is_err() {
            outbox.backlog.fetch_sub(len, Ordering::AcqRel);
            return Err(LinkError::WriterClosed);
        }
        Ok(())
    }

    fn request_reconnect(&self, reason: ReconnectReason) {
        let _ = self.commands.send(LinkCommand::Reconnect(reason));
    }
}

/// Results of background work, tagged with the socket or fetch generation
/// they belong to so stale ones can be dropped.
enum LinkInput {
    Opened { epoch: u64, stream: Box<WsStream> },
    ConnectFailed { epoch: u64, reason: String, unauthorized: bool },
    Closed { epoch: u64, code: Option<u16>, reason: String },
    WriteFailed { epoch: u64, reason: String },
    Credential { fetch: u64, result: Result<String, String> },
}

struct SocketTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct NetLink {
    machine: SessionMachine,
    handle: Arc<LinkHandle>,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::Sender<NetEvent>,
    inputs_tx: mpsc::UnboundedSender<LinkInput>,
    inputs_rx: mpsc::UnboundedReceiver<LinkInput>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    api_key: Option<String>,
    session_update: String,
    epoch: u64,
    fetch_epoch: u64,
    connect_timeout: Deadline,
    reconnect: Deadline,
    pending_connect: Option<JoinHandle<()>>,
    socket: Option<SocketTasks>,
}

impl NetLink {
    pub fn new(
        config: &Config,
        credentials: Option<Arc<dyn CredentialProvider>>,
        events: mpsc::Sender<NetEvent>,
    ) -> Result<(Self, Arc<LinkHandle>)> {
        let session_update = serde_json::to_string(&ClientEvent::SessionUpdate {
            session: SessionSettings::from_config(&config.session, &config.audio),
        })
        .context("Failed to encode session.update")?;

        let machine = SessionMachine::new(
            ReconnectPolicy::from_config(&config.reconnect),
            config.network.direct_url().map(str::to_owned),
            credentials.is_some(),
            random_jitter(),
        );

        let (cmd_tx, commands) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(LinkHandle::new(cmd_tx));

        let link = Self {
            machine,
            handle: handle.clone(),
            commands,
            events,
            inputs_tx,
            inputs_rx,
            credentials,
            api_key: config.network.api_key().map(str::to_owned),
            session_update,
            epoch: 0,
            fetch_epoch: 0,
            connect_timeout: Deadline::default(),
            reconnect: Deadline::default(),
            pending_connect: None,
            socket: None,
        };
        Ok((link, handle))
    }

    /// Serve [`LinkHandle`] commands and keep the session alive until
    /// shutdown. Returns an error only when reconnect attempts are exhausted.
    pub async fn run(mut self) -> Result<(), LinkError> {
        loop {
            if self.machine.is_stopped() {
                return Err(LinkError::Exhausted {
                    attempts: self.machine.attempts(),
                });
            }

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(LinkCommand::Connect) => self.apply(SessionEvent::ConnectRequested).await,
                    Some(LinkCommand::Close) => self.apply(SessionEvent::CloseRequested).await,
                    Some(LinkCommand::Reconnect(ReconnectReason::SendFailed)) => {
                        self.apply(SessionEvent::SendFailed).await
                    }
                    Some(LinkCommand::Reconnect(ReconnectReason::Unauthorized)) => {
                        self.apply(SessionEvent::Unauthorized).await
                    }
                    Some(LinkCommand::Shutdown) | None => {
                        self.apply(SessionEvent::CloseRequested).await;
                        log::info!("Session link stopped");
                        return Ok(());
                    }
                },
                Some(input) = self.inputs_rx.recv() => self.on_input(input).await,
                _ = self.connect_timeout.fired() => self.apply(SessionEvent::ConnectTimedOut).await,
                _ = self.reconnect.fired() => self.apply(SessionEvent::ReconnectTimerFired).await,
            }
        }
    }

    /// Feed one event to the machine, plus any events its actions raise
    /// synchronously, and carry out the resulting actions in order.
    async fn apply(&mut self, event: SessionEvent) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            let actions = self.machine.handle(event);
            // Connected is published by the session update
            let state = self.machine.state();
            if state != SessionState::Connected {
                self.handle.set_state(state);
            }
            for action in actions {
                if let Some(next) = self.perform(action).await {
                    pending.push_back(next);
                }
            }
        }
    }

    async fn perform(&mut self, action: SessionAction) -> Option<SessionEvent> {
        match action {
            SessionAction::FetchCredential => return self.fetch_credential(),
            SessionAction::OpenSocket { url } => return self.open_socket(&url),
            SessionAction::StartConnectTimeout(after) => self.connect_timeout.arm(after),
            SessionAction::CancelConnectTimeout => self.connect_timeout.cancel(),
            SessionAction::SendSessionUpdate => {
                if let Err(e) = self.handle.go_live(self.session_update.clone()) {
                    log::warn!("Failed to send session.update: {}", e);
                }
            }
            SessionAction::ScheduleReconnect { delay, .. } => self.reconnect.arm(delay),
            SessionAction::CancelReconnect => self.reconnect.cancel(),
            SessionAction::CloseSocket => self.close_socket(),
            SessionAction::ResetRelays => notify(&self.events, NetEvent::Reset).await,
            SessionAction::NotifyConnected => notify(&self.events, NetEvent::Connected).await,
            SessionAction::NotifyDisconnected => {
                notify(&self.events, NetEvent::Disconnected).await
            }
            SessionAction::Fatal { attempts } => {
                log::error!("Giving up after {} reconnect attempts", attempts);
            }
        }
        None
    }

    fn fetch_credential(&mut self) -> Option<SessionEvent> {
        let Some(provider) = self.credentials.clone() else {
            return Some(SessionEvent::CredentialFailed(
                "no credential provider configured".to_string(),
            ));
        };

        self.fetch_epoch += 1;
        let fetch = self.fetch_epoch;
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = provider.issue().await.map_err(|e| format!("{:#}", e));
            let _ = inputs.send(LinkInput::Credential { fetch, result });
        });
        None
    }

    fn open_socket(&mut self, url: &str) -> Option<SessionEvent> {
        self.close_socket();

        let request = match build_request(url, self.api_key.as_deref()) {
            Ok(request) => request,
            Err(e) => {
                return Some(SessionEvent::ConnectFailed {
                    reason: format!("{:#}", e),
                    unauthorized: false,
                });
            }
        };

        log::info!("Connecting to {}...", redact(url));
        let epoch = self.epoch;
        let inputs = self.inputs_tx.clone();
        self.pending_connect = Some(tokio::spawn(async move {
            let input = match connect_async(request).await {
                Ok((stream, _)) => LinkInput::Opened {
                    epoch,
                    stream: Box::new(stream),
                },
                Err(e) => LinkInput::ConnectFailed {
                    epoch,
                    unauthorized: is_unauthorized(&e),
                    reason: e.to_string(),
                },
            };
            let _ = inputs.send(input);
        }));
        None
    }

    /// Drop the current socket, if any. Anything it still reports is stale.
    fn close_socket(&mut self) {
        self.epoch += 1;
        if let Some(pending) = self.pending_connect.take() {
            pending.abort();
        }
        self.handle.clear_outbox();
        if let Some(tasks) = self.socket.take() {
            // the writer sends a close frame once its queue is dropped
            tasks.reader.abort();
            drop(tasks.writer);
        }
    }

    async fn on_input(&mut self, input: LinkInput) {
        match input {
            LinkInput::Opened { epoch, stream } => {
                if epoch != self.epoch {
                    log::debug!("Dropping socket from an abandoned connect");
                    return;
                }
                self.pending_connect = None;
                self.attach(*stream);
                self.apply(SessionEvent::Opened).await;
                if self.machine.state() != SessionState::Connected {
                    self.close_socket();
                }
            }
            LinkInput::ConnectFailed {
                epoch,
                reason,
                unauthorized,
            } => {
                if epoch == self.epoch {
                    self.pending_connect = None;
                    self.apply(SessionEvent::ConnectFailed {
                        reason,
                        unauthorized,
                    })
                    .await;
                }
            }
            LinkInput::Closed {
                epoch,
                code,
                reason,
            } => {
                if epoch == self.epoch {
                    self.apply(SessionEvent::Closed { code, reason }).await;
                }
            }
            LinkInput::WriteFailed { epoch, reason } => {
                if epoch == self.epoch {
                    log::warn!("Socket write failed: {}", reason);
                    self.apply(SessionEvent::SendFailed).await;
                }
            }
            LinkInput::Credential { fetch, result } => {
                if fetch != self.fetch_epoch {
                    return;
                }
                let event = match result {
                    Ok(url) => SessionEvent::CredentialIssued(url),
                    Err(reason) => SessionEvent::CredentialFailed(reason),
                };
                self.apply(event).await;
            }
        }
    }

    fn attach(&mut self, stream: WsStream) {
        let (write, read) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));

        let writer = tokio::spawn(write_loop(
            self.epoch,
            write,
            rx,
            backlog.clone(),
            self.inputs_tx.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            self.epoch,
            read,
            self.events.clone(),
            self.inputs_tx.clone(),
        ));

        self.handle.install(Outbox { tx, backlog });
        self.socket = Some(SocketTasks { reader, writer });
    }
}

async fn notify(events: &mpsc::Sender<NetEvent>, event: NetEvent) {
    if let Err(e) = events.send(event).await {
        log::warn!("Core loop is gone, dropping link event: {}", e);
    }
}

async fn write_loop(
    epoch: u64,
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    backlog: Arc<AtomicUsize>,
    inputs: mpsc::UnboundedSender<LinkInput>,
) {
    while let Some(msg) = rx.recv().await {
        let len = msg.len();
        let result = write.send(msg).await;
        backlog.fetch_sub(len, Ordering::AcqRel);
        if let Err(e) = result {
            let _ = inputs.send(LinkInput::WriteFailed {
                epoch,
                reason: e.to_string(),
            });
            return;
        }
    }
    let _ = write.close().await;
}

async fn read_loop(
    epoch: u64,
    mut read: SplitStream<WsStream>,
    events: mpsc::Sender<NetEvent>,
    inputs: mpsc::UnboundedSender<LinkInput>,
) {
    let (code, reason) = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                if events.send(NetEvent::Text(text.as_str().to_owned())).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_owned()),
                    None => (None, "closed without status".to_string()),
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break (None, e.to_string()),
            None => break (None, "stream ended".to_string()),
        }
    };
    let _ = inputs.send(LinkInput::Closed {
        epoch,
        code,
        reason,
    });
}

fn build_request(url: &str, api_key: Option<&str>) -> Result<Request<()>> {
    let parsed = Url::parse(url).with_context(|| format!("Invalid socket URL {}", redact(url)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("Socket URL has no host"))?;
    let host = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let mut builder = Request::builder()
        .method("GET")
        .uri(url)
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .header("OpenAI-Beta", "realtime=v1");
    if let Some(key) = api_key {
        builder = builder.header("Authorization", format!("Bearer {}", key));
    }
    Ok(builder.body(())?)
}

/// A rejected upgrade with 401/403 means the credential is bad.
fn is_unauthorized(err: &WsError) -> bool {
    match err {
        WsError::Http(response) => matches!(response.status().as_u16(), 401 | 403),
        _ => false,
    }
}

/// Strip the query string, which may carry a credential.
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::{Instant, sleep, timeout};
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as ServerRequest, Response as ServerResponse,
    };
    use tokio_tungstenite::tungstenite::http::StatusCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    const APPEND: &str = r#"{"type":"input_audio_buffer.append","audio":"AAAA"}"#;

    fn local_config(addr: std::net::SocketAddr) -> Config {
        let mut config = Config::default();
        config.network.ws_url = format!("ws://{}/realtime", addr);
        config.reconnect.max_jitter_ms = 0;
        config
    }

    fn handle_with_outbox(state: SessionState) -> (LinkHandle, mpsc::UnboundedReceiver<Message>, Arc<AtomicUsize>) {
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let handle = LinkHandle::new(cmd_tx);
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        handle.install(Outbox {
            tx,
            backlog: backlog.clone(),
        });
        handle.set_state(state);
        (handle, rx, backlog)
    }

    #[test]
    fn send_requires_connected_state() {
        let (handle, _rx, _) = handle_with_outbox(SessionState::Connecting);
        assert_eq!(handle.send_text("x".to_string()), Err(LinkError::NotConnected));
    }

    #[test]
    fn send_tracks_backlog() {
        let (handle, mut rx, backlog) = handle_with_outbox(SessionState::Connected);
        handle.send_text("hello".to_string()).unwrap();
        handle.send_text("world!".to_string()).unwrap();

        assert_eq!(handle.buffered_amount(), 11);
        assert_eq!(backlog.load(Ordering::Acquire), 11);
        assert_eq!(rx.try_recv().unwrap(), Message::Text("hello".into()));
    }

    #[test]
    fn send_after_writer_exit_fails() {
        let (handle, rx, backlog) = handle_with_outbox(SessionState::Connected);
        drop(rx);
        assert_eq!(handle.send_text("x".to_string()), Err(LinkError::WriterClosed));
        assert_eq!(backlog.load(Ordering::Acquire), 0);
    }

    #[test]
    fn go_live_puts_session_update_ahead_of_relay_traffic() {
        let (handle, mut rx, _) = handle_with_outbox(SessionState::Connecting);
        assert_eq!(handle.send_text(APPEND.to_string()), Err(LinkError::NotConnected));

        handle.go_live("update".to_string()).unwrap();
        assert_eq!(handle.state(), SessionState::Connected);
        handle.send_text(APPEND.to_string()).unwrap();

        assert_eq!(rx.try_recv().unwrap(), Message::Text("update".into()));
        assert_eq!(rx.try_recv().unwrap(), Message::Text(APPEND.into()));
    }

    #[test]
    fn no_backlog_without_socket() {
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let handle = LinkHandle::new(cmd_tx);
        assert_eq!(handle.buffered_amount(), 0);
        assert_eq!(handle.state(), SessionState::Disconnected);
    }

    #[test]
    fn request_carries_upgrade_and_auth_headers() {
        let request = build_request("wss://service.test:8443/v1/realtime?model=m", Some("sk-test")).unwrap();
        let headers = request.headers();
        assert_eq!(headers["Host"], "service.test:8443");
        assert_eq!(headers["Upgrade"], "websocket");
        assert_eq!(headers["Authorization"], "Bearer sk-test");

        let anonymous = build_request("wss://service.test/v1/realtime", None).unwrap();
        assert_eq!(anonymous.headers()["Host"], "service.test");
        assert!(anonymous.headers().get("Authorization").is_none());

        assert!(build_request("not a url", None).is_err());
    }

    #[test]
    fn redacts_query() {
        assert_eq!(redact("wss://h/p?token=secret"), "wss://h/p");
        assert_eq!(redact("wss://h/p"), "wss://h/p");
    }

    #[tokio::test]
    async fn handshake_rejection_status_decides_authorization() {
        for (status, unauthorized) in [
            (StatusCode::UNAUTHORIZED, true),
            (StatusCode::FORBIDDEN, true),
            (StatusCode::INTERNAL_SERVER_ERROR, false),
        ] {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let reject = move |_: &ServerRequest,
                                   _: ServerResponse|
                      -> Result<ServerResponse, ErrorResponse> {
                    let mut response = ErrorResponse::new(None);
                    *response.status_mut() = status;
                    Err(response)
                };
                let _ = tokio_tungstenite::accept_hdr_async(stream, reject).await;
            });

            let request = build_request(&format!("ws://{}/realtime", addr), None).unwrap();
            match connect_async(request).await {
                Ok(_) => panic!("upgrade should be rejected with {status}"),
                Err(e) => assert_eq!(is_unauthorized(&e), unauthorized, "{status}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_update_precedes_relay_traffic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            let second = ws.next().await.unwrap().unwrap();
            let _ = received_tx.send((
                first.to_text().unwrap().to_owned(),
                second.to_text().unwrap().to_owned(),
            ));
            while let Some(Ok(_)) = ws.next().await {}
        });

        // a full event channel holds the link up right after the open
        let (events_tx, mut events_rx) = mpsc::channel(1);
        events_tx.try_send(NetEvent::Text("queued".to_string())).unwrap();
        let (link, handle) = NetLink::new(&local_config(addr), None, events_tx).unwrap();
        let task = tokio::spawn(link.run());
        handle.connect();

        timeout(Duration::from_secs(5), async {
            loop {
                match handle.send_text(APPEND.to_string()) {
                    Ok(()) => break,
                    Err(e) => {
                        assert_eq!(e, LinkError::NotConnected);
                        sleep(Duration::from_millis(1)).await;
                    }
                }
            }
        })
        .await
        .expect("link never went live");

        let (first, second) = timeout(Duration::from_secs(5), received_rx).await.unwrap().unwrap();
        assert!(first.starts_with(r#"{"type":"session.update""#), "{first}");
        assert_eq!(second, APPEND);

        assert_eq!(events_rx.recv().await, Some(NetEvent::Text("queued".to_string())));
        assert_eq!(events_rx.recv().await, Some(NetEvent::Connected));

        handle.shutdown();
        tokio::spawn(async move { while events_rx.recv().await.is_some() {} });
        assert_eq!(timeout(Duration::from_secs(5), task).await.unwrap().unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_times_out_and_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (link, handle) = NetLink::new(&local_config(addr), None, events_tx).unwrap();

        let start = Instant::now();
        let task = tokio::spawn(link.run());
        handle.connect();

        // accept the TCP connection but never answer the upgrade
        let (_first, _) = listener.accept().await.unwrap();
        let (_second, _) = listener.accept().await.unwrap();
        // 15 s connect timeout, then the 1 s first backoff
        assert!(start.elapsed() >= Duration::from_secs(16));

        handle.shutdown();
        assert_eq!(timeout(Duration::from_secs(5), task).await.unwrap().unwrap(), Ok(()));
    }

    #[derive(Default)]
    struct DownProvider {
        calls: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl CredentialProvider for DownProvider {
        async fn issue(&self) -> Result<String> {
            self.calls.lock().unwrap().push(Instant::now());
            Err(anyhow!("token endpoint unavailable"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_timer_backs_off_until_exhausted() {
        let mut config = Config::default();
        config.network.token_url = "https://token.test/session".to_string();
        config.reconnect.max_jitter_ms = 0;
        let provider = Arc::new(DownProvider::default());
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (link, handle) = NetLink::new(
            &config,
            Some(provider.clone() as Arc<dyn CredentialProvider>),
            events_tx,
        )
        .unwrap();

        let start = Instant::now();
        let task = tokio::spawn(link.run());
        handle.connect();

        let result = timeout(Duration::from_secs(300), task).await.unwrap().unwrap();
        assert_eq!(result, Err(LinkError::Exhausted { attempts: 6 }));

        let offsets: Vec<u64> = provider
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|at| (*at - start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 1, 3, 7, 15, 31, 61]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relays_service_text_and_honours_normal_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (first_tx, first_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            let _ = first_tx.send(first.to_text().unwrap().to_owned());

            ws.send(Message::Text(r#"{"type":"session.created"}"#.into()))
                .await
                .unwrap();
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "bye".into(),
                }))
                .await;
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (link, handle) = NetLink::new(&local_config(addr), None, events_tx).unwrap();
        let task = tokio::spawn(link.run());
        handle.connect();

        let mut events = Vec::new();
        timeout(Duration::from_secs(5), async {
            while let Some(event) = events_rx.recv().await {
                let done = event == NetEvent::Reset;
                events.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("link events");

        assert_eq!(events.first(), Some(&NetEvent::Connected));
        assert!(events.contains(&NetEvent::Text(r#"{"type":"session.created"}"#.to_string())));
        assert!(events.contains(&NetEvent::Disconnected));

        let first = timeout(Duration::from_secs(5), first_rx).await.unwrap().unwrap();
        assert!(first.starts_with(r#"{"type":"session.update""#));

        // a normal close leaves the link idle rather than reconnecting
        assert_eq!(handle.state(), SessionState::Disconnected);
        handle.shutdown();
        assert_eq!(timeout(Duration::from_secs(5), task).await.unwrap().unwrap(), Ok(()));
    }
}
