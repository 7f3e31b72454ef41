use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use xmpp_parsers::jid::Jid;
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use chirp_core::config::{SessionProfile, SessionSettings};
use chirp_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use chirp_core::roster::RosterStore;

use crate::error::ConnectionError;
use crate::modules::ModuleSet;
use crate::pipeline::{ProcessorContext, StanzaPipeline};
use crate::processors::{MessageProcessor, SubscriptionProcessor};
use crate::stanza::Stanza;
use crate::transport::XmppTransport;

/// How long one [`SessionManager::step`] waits for an inbound frame before
/// handing control back to the embedder's loop.
const INBOUND_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Stream established, SASL not yet run.
    Connected,
    Authenticating,
    Online,
    /// Authenticated, available presence not yet broadcast.
    Offline,
}

/// The messaging session: owns the transport, the protocol modules, and the
/// connection state machine, and feeds inbound stanzas through the pipeline.
///
/// Construct one per process and drive it from a single task — either
/// [`SessionManager::run`] for a headless loop, or repeated calls to
/// [`SessionManager::step`] interleaved with UI commands. Everything
/// (dial results, auth results, inbound stanzas) is serialized on that task.
pub struct SessionManager<T: XmppTransport> {
    state: ConnectionState,
    /// Presence availability, orthogonal to the connection state.
    available: bool,
    ever_connected: bool,
    profile: Option<SessionProfile>,
    transport: Option<T>,
    modules: Option<ModuleSet>,
    pipeline: StanzaPipeline,
    event_bus: Arc<dyn EventBus>,
    roster: Arc<dyn RosterStore>,
    settings: SessionSettings,
}

impl<T: XmppTransport> SessionManager<T> {
    pub fn new(
        event_bus: Arc<dyn EventBus>,
        roster: Arc<dyn RosterStore>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            available: false,
            ever_connected: false,
            profile: None,
            transport: None,
            modules: None,
            pipeline: StanzaPipeline::new(),
            event_bus,
            roster,
            settings,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Build and activate the protocol modules and register the session's
    /// own stanza handlers. Calling this twice is a logged no-op.
    pub fn setup_stream(&mut self) {
        if self.modules.is_some() {
            warn!("setup_stream invoked multiple times");
            return;
        }

        let mut modules = ModuleSet::new(
            self.event_bus.clone(),
            self.roster.clone(),
            self.settings.max_reconnect_attempts,
        );
        modules.activate_all(&mut self.pipeline);

        self.pipeline.register(Box::new(MessageProcessor::new(
            self.event_bus.clone(),
            self.roster.clone(),
            self.settings.auto_echo,
        )));
        self.pipeline.register(Box::new(SubscriptionProcessor::new(
            self.event_bus.clone(),
            self.roster.clone(),
        )));

        self.modules = Some(modules);
    }

    /// Undo [`SessionManager::setup_stream`]: unregister the session's
    /// handlers, deactivate modules in reverse order, and force a
    /// disconnect. Safe to call any number of times.
    pub async fn teardown_stream(&mut self) {
        self.pipeline.unregister("subscription");
        self.pipeline.unregister("message");
        if let Some(mut modules) = self.modules.take() {
            modules.deactivate_all(&mut self.pipeline);
        }
        self.disconnect().await;
    }

    /// Accept a connection request.
    ///
    /// Returns `true` without side effects when a connection attempt is
    /// already underway. Returns `false` on an incomplete profile or a JID
    /// the transport rejects outright. A `true` return only means the
    /// attempt was accepted: the handshake result arrives asynchronously on
    /// the event bus, never through this call.
    pub fn connect(&mut self, profile: &SessionProfile) -> bool {
        if self.state != ConnectionState::Disconnected {
            return true;
        }

        if !profile.is_complete() {
            warn!("rejecting connect: profile has empty fields");
            return false;
        }

        if let Err(parse_error) = profile.jid.parse::<Jid>() {
            error!(jid = %profile.jid, %parse_error, "rejecting connect: malformed JID");
            return false;
        }

        self.profile = Some(profile.clone());
        self.state = ConnectionState::Connecting;
        true
    }

    /// Send unavailable presence (best effort), close the transport, and
    /// land in `Disconnected`. Never fails from the caller's perspective.
    pub async fn disconnect(&mut self) {
        if self.transport.is_some() {
            self.go_offline().await;
        }
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close().await;
        }
        if self.state != ConnectionState::Disconnected {
            self.emit(
                "system.connection.lost",
                EventPayload::ConnectionLost {
                    reason: "disconnect requested".to_string(),
                    will_retry: false,
                },
            );
        }
        self.state = ConnectionState::Disconnected;
        self.available = false;
    }

    /// Broadcast available presence, with module payloads attached.
    /// Fire and forget.
    pub async fn go_online(&mut self) {
        let mut presence = Presence::new(PresenceType::None);
        if let Some(modules) = &self.modules {
            presence.payloads.extend(modules.presence_payloads());
        }
        self.send_stanza(&Stanza::Presence(Box::new(presence))).await;
        self.available = true;
        if self.state == ConnectionState::Offline {
            self.state = ConnectionState::Online;
        }
    }

    /// Broadcast unavailable presence. A presence-only change: the
    /// connection state is untouched.
    pub async fn go_offline(&mut self) {
        let presence = Presence::new(PresenceType::Unavailable);
        self.send_stanza(&Stanza::Presence(Box::new(presence))).await;
        self.available = false;
    }

    /// Drive the session until it lands in `Disconnected` or hits a
    /// terminal error.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        while self.state != ConnectionState::Disconnected {
            self.step().await?;
        }
        Ok(())
    }

    /// Advance the session by one unit of work: a dial-and-authenticate
    /// pass when connecting, otherwise one inbound frame or idle poll tick.
    pub async fn step(&mut self) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Disconnected => Ok(()),
            ConnectionState::Connecting => self.establish().await,
            _ => self.poll_inbound().await,
        }
    }

    /// Parse one raw inbound frame and run it through the pipeline,
    /// flushing any replies the processors queued.
    pub async fn handle_frame(&mut self, raw: &[u8]) {
        let mut stanza = match Stanza::parse(raw) {
            Ok(stanza) => stanza,
            Err(parse_error) => {
                debug!(%parse_error, "ignoring unparseable inbound frame");
                return;
            }
        };

        let mut ctx = ProcessorContext::new();
        self.pipeline.dispatch(&mut stanza, &mut ctx);
        for reply in ctx.take_replies() {
            self.send_stanza(&reply).await;
        }
    }

    async fn establish(&mut self) -> Result<(), ConnectionError> {
        let Some(profile) = self.profile.clone() else {
            self.state = ConnectionState::Disconnected;
            return Err(ConnectionError::NotConnected);
        };
        let io_timeout = Duration::from_secs(u64::from(self.settings.timeout_seconds.max(1)));
        let mut attempt = 0_u32;

        loop {
            match T::connect(&profile, io_timeout).await {
                Ok(transport) => {
                    self.transport = Some(transport);
                    self.state = ConnectionState::Connected;
                    self.ever_connected = true;
                    debug!(host = %profile.host, "stream connected");
                    return self.authenticate(&profile).await;
                }
                Err(dial_error) => {
                    if !self.ever_connected {
                        error!(
                            host = %profile.host,
                            "unable to reach the server; check the configured host"
                        );
                    }
                    attempt = self.handle_dial_failure(dial_error, attempt).await?;
                }
            }
        }
    }

    async fn authenticate(&mut self, profile: &SessionProfile) -> Result<(), ConnectionError> {
        self.state = ConnectionState::Authenticating;
        let transport = self
            .transport
            .as_mut()
            .ok_or(ConnectionError::NotConnected)?;

        match transport.authenticate(&profile.password).await {
            Ok(()) => {
                self.state = ConnectionState::Offline;
                info!(jid = %profile.jid, "authenticated");
                self.emit(
                    "system.connection.established",
                    EventPayload::ConnectionEstablished {
                        jid: profile.jid.clone(),
                    },
                );

                self.go_online().await;

                let follow_ups = match self.modules.as_mut() {
                    Some(modules) => modules.on_session_established(),
                    None => Vec::new(),
                };
                for stanza in follow_ups {
                    self.send_stanza(&stanza).await;
                }
                Ok(())
            }
            Err(auth_error) => {
                // No retry here or anywhere below: bad credentials stay bad.
                error!(%auth_error, "authentication failed");
                self.emit_error(&auth_error);
                self.emit(
                    "system.connection.lost",
                    EventPayload::ConnectionLost {
                        reason: auth_error.to_string(),
                        will_retry: false,
                    },
                );
                if let Some(mut transport) = self.transport.take() {
                    let _ = transport.close().await;
                }
                self.state = ConnectionState::Disconnected;
                self.available = false;
                Err(auth_error)
            }
        }
    }

    async fn handle_dial_failure(
        &mut self,
        dial_error: ConnectionError,
        attempt: u32,
    ) -> Result<u32, ConnectionError> {
        self.transport = None;
        let next_attempt = attempt.saturating_add(1);
        let will_retry = self
            .modules
            .as_ref()
            .map(|m| m.reconnect.should_retry(&dial_error, next_attempt))
            .unwrap_or(false);

        self.emit(
            "system.connection.lost",
            EventPayload::ConnectionLost {
                reason: dial_error.to_string(),
                will_retry,
            },
        );
        self.emit_error(&dial_error);

        if !will_retry {
            self.state = ConnectionState::Disconnected;
            return Err(dial_error);
        }

        self.emit(
            "system.connection.reconnecting",
            EventPayload::ConnectionReconnecting {
                attempt: next_attempt,
            },
        );
        let delay = self
            .modules
            .as_ref()
            .map(|m| m.reconnect.delay(next_attempt))
            .unwrap_or(Duration::from_secs(1));
        tokio::time::sleep(delay).await;
        Ok(next_attempt)
    }

    async fn poll_inbound(&mut self) -> Result<(), ConnectionError> {
        let outcome = {
            let Some(transport) = self.transport.as_mut() else {
                self.state = ConnectionState::Disconnected;
                return Ok(());
            };
            tokio::time::timeout(INBOUND_POLL, transport.recv()).await
        };

        match outcome {
            // Idle tick; give the embedder's loop a turn.
            Err(_) => Ok(()),
            Ok(Ok(frame)) => {
                self.handle_frame(&frame).await;
                Ok(())
            }
            Ok(Err(stream_error)) => self.on_stream_dropped(stream_error).await,
        }
    }

    async fn on_stream_dropped(
        &mut self,
        stream_error: ConnectionError,
    ) -> Result<(), ConnectionError> {
        warn!(%stream_error, "stream dropped");
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close().await;
        }
        self.available = false;

        let will_retry = self
            .modules
            .as_ref()
            .map(|m| m.reconnect.should_retry(&stream_error, 1))
            .unwrap_or(false);
        self.emit(
            "system.connection.lost",
            EventPayload::ConnectionLost {
                reason: stream_error.to_string(),
                will_retry,
            },
        );
        self.emit_error(&stream_error);

        if will_retry {
            self.state = ConnectionState::Connecting;
            Ok(())
        } else {
            self.state = ConnectionState::Disconnected;
            Err(stream_error)
        }
    }

    async fn send_stanza(&mut self, stanza: &Stanza) {
        let bytes = match stanza.to_bytes() {
            Ok(bytes) => bytes,
            Err(serialize_error) => {
                warn!(%serialize_error, "dropping unserializable outbound stanza");
                return;
            }
        };
        let Some(transport) = self.transport.as_mut() else {
            warn!(stanza = stanza.name(), "cannot send while disconnected");
            return;
        };
        if let Err(send_error) = transport.send(&bytes).await {
            warn!(%send_error, "outbound send failed");
        }
    }

    fn emit(&self, channel: &str, payload: EventPayload) {
        let Ok(channel) = Channel::new(channel) else {
            return;
        };
        let _ = self
            .event_bus
            .publish(Event::new(channel, EventSource::Xmpp, payload));
    }

    fn emit_error(&self, error: &ConnectionError) {
        self.emit(
            "system.error.occurred",
            EventPayload::ErrorOccurred {
                component: "session".to_string(),
                message: error.to_string(),
                recoverable: error.is_retryable(),
            },
        );
    }
}
