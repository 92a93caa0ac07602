//! Connection lifecycle of the session socket as a pure state machine.
//!
//! The machine performs no I/O. The driver feeds it [`SessionEvent`]s and
//! carries out the returned [`SessionAction`]s in order. Every transition
//! happens inside one `handle` call, so transitions never interleave.

use std::time::Duration;

use super::backoff::{JitterSource, ReconnectPolicy};
use crate::state_machine::SessionState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectRequested,
    ReconnectTimerFired,
    CredentialIssued(String),
    CredentialFailed(String),
    Opened,
    ConnectTimedOut,
    ConnectFailed { reason: String, unauthorized: bool },
    Closed { code: Option<u16>, reason: String },
    /// A relay could not hand a message to the socket.
    SendFailed,
    /// The service reported an authorization failure in-band.
    Unauthorized,
    CloseRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    FetchCredential,
    OpenSocket { url: String },
    StartConnectTimeout(Duration),
    CancelConnectTimeout,
    SendSessionUpdate,
    ScheduleReconnect { attempt: u32, delay: Duration },
    CancelReconnect,
    CloseSocket,
    ResetRelays,
    NotifyConnected,
    NotifyDisconnected,
    Fatal { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Permanent,
    Unauthorized,
    Recoverable,
}

/// 1000 normal, 1002 protocol error, 1003 unsupported data, 1015 TLS failure
/// are final. 1008 policy violation and 4001 mean the credential was refused.
pub fn classify_close(code: Option<u16>) -> CloseKind {
    match code {
        Some(1000 | 1002 | 1003 | 1015) => CloseKind::Permanent,
        Some(1008 | 4001) => CloseKind::Unauthorized,
        _ => CloseKind::Recoverable,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchPurpose {
    Connect,
    Refresh,
}

pub struct SessionMachine {
    state: SessionState,
    policy: ReconnectPolicy,
    jitter: JitterSource,
    direct_url: Option<String>,
    can_refresh: bool,
    fresh_url: Option<String>,
    attempts: u32,
    reconnect_pending: bool,
    fetch: Option<FetchPurpose>,
    refresh_used: bool,
    /// The last cycle ended on an authorization failure. A session opened
    /// after one is provisional and does not reset the counters.
    auth_failed: bool,
    stopped: bool,
}

impl SessionMachine {
    /// `direct_url` is dialled as-is when set; otherwise every connect asks
    /// for a credential first. `can_refresh` says whether a credential
    /// provider exists to recover from authorization failures.
    pub fn new(
        policy: ReconnectPolicy,
        direct_url: Option<String>,
        can_refresh: bool,
        jitter: JitterSource,
    ) -> Self {
        Self {
            state: SessionState::Disconnected,
            policy,
            jitter,
            direct_url,
            can_refresh,
            fresh_url: None,
            attempts: 0,
            reconnect_pending: false,
            fetch: None,
            refresh_used: false,
            auth_failed: false,
            stopped: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Set once reconnects are exhausted. A stopped machine ignores every
    /// further event.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        if self.stopped {
            return Vec::new();
        }

        match event {
            SessionEvent::ConnectRequested => self.connect(),
            SessionEvent::ReconnectTimerFired => {
                if !self.reconnect_pending {
                    return Vec::new();
                }
                self.reconnect_pending = false;
                self.connect()
            }
            SessionEvent::CredentialIssued(url) => match self.fetch.take() {
                Some(FetchPurpose::Connect) if self.state == SessionState::Connecting => {
                    self.open(url)
                }
                Some(FetchPurpose::Refresh) => {
                    log::info!("Credential refreshed, reconnecting");
                    self.fresh_url = Some(url);
                    self.connect()
                }
                _ => Vec::new(),
            },
            SessionEvent::CredentialFailed(reason) => match self.fetch.take() {
                Some(FetchPurpose::Connect) => {
                    log::warn!("Credential request failed: {}", reason);
                    self.state = SessionState::Disconnected;
                    self.schedule_reconnect()
                }
                Some(FetchPurpose::Refresh) => {
                    log::warn!("Credential refresh failed: {}, falling back to backoff", reason);
                    self.schedule_reconnect()
                }
                None => Vec::new(),
            },
            SessionEvent::Opened => {
                if self.state != SessionState::Connecting {
                    return Vec::new();
                }
                log::info!("Session socket open");
                self.state = SessionState::Connected;
                if !self.auth_failed {
                    self.attempts = 0;
                    self.refresh_used = false;
                }
                vec![
                    SessionAction::CancelConnectTimeout,
                    SessionAction::SendSessionUpdate,
                    SessionAction::NotifyConnected,
                ]
            }
            SessionEvent::ConnectTimedOut => {
                if self.state != SessionState::Connecting {
                    return Vec::new();
                }
                log::warn!("Connect timed out after {:?}", self.policy.connect_timeout);
                self.state = SessionState::Disconnected;
                let mut actions = vec![SessionAction::CloseSocket];
                actions.extend(self.schedule_reconnect());
                actions
            }
            SessionEvent::ConnectFailed {
                reason,
                unauthorized,
            } => {
                if self.state != SessionState::Connecting {
                    return Vec::new();
                }
                log::warn!("Connect failed: {}", reason);
                self.state = SessionState::Disconnected;
                let mut actions = vec![
                    SessionAction::CancelConnectTimeout,
                    SessionAction::CloseSocket,
                ];
                if unauthorized {
                    actions.extend(self.refresh_or_backoff());
                } else {
                    actions.extend(self.schedule_reconnect());
                }
                actions
            }
            SessionEvent::Closed { code, reason } => self.on_closed(code, reason),
            SessionEvent::SendFailed => {
                if self.state != SessionState::Connected {
                    return Vec::new();
                }
                log::warn!("Send on session socket failed, reconnecting");
                self.settle();
                let mut actions = self.drop_socket();
                actions.extend(self.schedule_reconnect());
                actions
            }
            SessionEvent::Unauthorized => {
                if self.state == SessionState::Disconnected {
                    return Vec::new();
                }
                log::warn!("Service rejected credential");
                let mut actions = self.drop_socket();
                actions.extend(self.refresh_or_backoff());
                actions
            }
            SessionEvent::CloseRequested => self.teardown(),
        }
    }

    fn connect(&mut self) -> Vec<SessionAction> {
        if self.state != SessionState::Disconnected {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(SessionAction::CancelReconnect);
        }

        self.state = SessionState::Connecting;
        match self.fresh_url.take().or_else(|| self.direct_url.clone()) {
            Some(url) => actions.extend(self.open(url)),
            None => {
                self.fetch = Some(FetchPurpose::Connect);
                actions.push(SessionAction::FetchCredential);
            }
        }
        actions
    }

    fn open(&mut self, url: String) -> Vec<SessionAction> {
        vec![
            SessionAction::OpenSocket { url },
            SessionAction::StartConnectTimeout(self.policy.connect_timeout),
        ]
    }

    fn on_closed(&mut self, code: Option<u16>, reason: String) -> Vec<SessionAction> {
        if self.state == SessionState::Disconnected {
            return Vec::new();
        }
        log::info!("Session socket closed (code {:?}): {}", code, reason);

        let kind = classify_close(code);
        if kind != CloseKind::Unauthorized && self.state == SessionState::Connected {
            self.settle();
        }

        let mut actions = self.drop_socket();
        match kind {
            CloseKind::Permanent => {
                log::info!("Close is not recoverable, staying disconnected");
                actions.push(SessionAction::ResetRelays);
            }
            CloseKind::Unauthorized => actions.extend(self.refresh_or_backoff()),
            CloseKind::Recoverable => actions.extend(self.schedule_reconnect()),
        }
        actions
    }

    /// Leave the socket behind without touching reconnect bookkeeping.
    fn drop_socket(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        match self.state {
            SessionState::Connecting => actions.push(SessionAction::CancelConnectTimeout),
            SessionState::Connected => actions.push(SessionAction::NotifyDisconnected),
            SessionState::Disconnected => {}
        }
        actions.push(SessionAction::CloseSocket);
        self.fetch = None;
        self.state = SessionState::Disconnected;
        actions
    }

    /// A session ended for a reason other than its credential, so the
    /// credential it used was good.
    fn settle(&mut self) {
        if self.auth_failed {
            self.auth_failed = false;
            self.attempts = 0;
            self.refresh_used = false;
        }
    }

    fn refresh_or_backoff(&mut self) -> Vec<SessionAction> {
        self.auth_failed = true;
        if self.can_refresh && !self.refresh_used {
            self.refresh_used = true;
            self.fetch = Some(FetchPurpose::Refresh);
            log::info!("Refreshing credential before reconnecting");
            return vec![SessionAction::FetchCredential];
        }
        self.schedule_reconnect()
    }

    fn schedule_reconnect(&mut self) -> Vec<SessionAction> {
        if self.attempts >= self.policy.max_attempts {
            let mut actions = self.teardown();
            self.stopped = true;
            actions.push(SessionAction::Fatal {
                attempts: self.attempts,
            });
            return actions;
        }

        self.attempts += 1;
        let jitter = (self.jitter)(self.policy.max_jitter);
        let delay = self.policy.delay_for(self.attempts, jitter);
        self.reconnect_pending = true;
        log::info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay,
            self.attempts,
            self.policy.max_attempts
        );
        vec![SessionAction::ScheduleReconnect {
            attempt: self.attempts,
            delay,
        }]
    }

    fn teardown(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(SessionAction::CancelReconnect);
        }
        if self.state != SessionState::Disconnected {
            actions.extend(self.drop_socket());
        }
        self.fetch = None;
        self.fresh_url = None;
        self.auth_failed = false;
        actions.push(SessionAction::ResetRelays);
        actions
    }
}
