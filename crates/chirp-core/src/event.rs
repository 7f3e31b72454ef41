use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;
use crate::roster::RosterEntry;

/// Hierarchical channel name, validated on construction.
///
/// Channels are dot-separated, lowercase, and rooted in one of the three
/// domains: `system`, `xmpp`, or `ui` (e.g. `xmpp.message.received`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.' | '_'))
        {
            return false;
        }

        matches!(
            name.split('.').next().unwrap_or_default(),
            "system" | "xmpp" | "ui"
        )
    }

    /// First segment of the channel name.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Envelope wrapping every event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }
}

/// The component that emitted an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    System(String),
    Xmpp,
    Ui,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Connection lifecycle ──────────────────────────────────────
    ConnectionEstablished {
        jid: String,
    },
    ConnectionLost {
        reason: String,
        will_retry: bool,
    },
    ConnectionReconnecting {
        attempt: u32,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Inbound chat traffic ──────────────────────────────────────
    MessageReceived {
        message: ChatMessage,
    },
    SubscriptionRequest {
        from: String,
        display_name: String,
    },

    // ── Roster ────────────────────────────────────────────────────
    RosterReceived {
        entries: Vec<RosterEntry>,
    },
    RosterUpdated {
        entry: RosterEntry,
    },
    RosterRemoved {
        jid: String,
    },
}

/// A one-to-one chat message as delivered to consumers.
///
/// `display_name` is resolved against the roster at classification time and
/// falls back to the empty string for unknown senders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub from: String,
    pub display_name: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// Publish/subscribe surface consumed by the session manager and the UI.
pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

/// Broadcast-channel bus with one sender per channel domain.
///
/// Publish order is preserved within a domain; subscribers filter with a
/// compiled glob, so `xmpp.roster.*` and `**` both work.
#[derive(Clone)]
pub struct BroadcastEventBus {
    system: broadcast::Sender<Event>,
    xmpp: broadcast::Sender<Event>,
    ui: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (system, _) = broadcast::channel(capacity);
        let (xmpp, _) = broadcast::channel(capacity);
        let (ui, _) = broadcast::channel(capacity);
        Self { system, xmpp, ui }
    }

    fn sender(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system),
            "xmpp" => Some(&self.xmpp),
            "ui" => Some(&self.ui),
            _ => None,
        }
    }

    fn receivers(&self, pattern: &str) -> Result<Receivers, EventBusError> {
        let first = pattern.split('.').next().unwrap_or_default();
        if first.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        // A glob in the first segment can match any domain.
        if has_glob_meta(first) {
            return Ok(Receivers {
                system: Some(self.system.subscribe()),
                xmpp: Some(self.xmpp.subscribe()),
                ui: Some(self.ui.subscribe()),
            });
        }

        let mut receivers = Receivers {
            system: None,
            xmpp: None,
            ui: None,
        };
        match first {
            "system" => receivers.system = Some(self.system.subscribe()),
            "xmpp" => receivers.xmpp = Some(self.xmpp.subscribe()),
            "ui" => receivers.ui = Some(self.ui.subscribe()),
            _ => return Err(EventBusError::InvalidPattern(pattern.to_string())),
        }
        Ok(receivers)
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let sender = self
            .sender(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        // A send error only means there are no subscribers right now.
        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers(pattern)?;
        Ok(EventSubscription { matcher, receivers })
    }
}

struct Receivers {
    system: Option<broadcast::Receiver<Event>>,
    xmpp: Option<broadcast::Receiver<Event>>,
    ui: Option<broadcast::Receiver<Event>>,
}

/// Handle returned by [`EventBus::subscribe`].
pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: Receivers,
}

impl EventSubscription {
    /// Wait for the next event whose channel matches the subscription glob.
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let system = self.receivers.system.as_mut();
            let xmpp = self.receivers.xmpp.as_mut();
            let ui = self.receivers.ui.as_mut();

            let received = tokio::select! {
                result = recv_domain(system) => result,
                result = recv_domain(xmpp) => result,
                result = recv_domain(ui) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(EventBusError::Lagged(missed));
                }
            }
        }
    }
}

async fn recv_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment
        .chars()
        .any(|c| matches!(c, '*' | '?' | '[' | ']' | '{' | '}' | '!'))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::roster::Subscription;

    #[test]
    fn channel_validation() {
        assert!(Channel::is_valid("system.connection.established"));
        assert!(Channel::is_valid("xmpp.message.received"));
        assert!(Channel::is_valid("ui.conversation.opened"));
        assert!(Channel::is_valid("xmpp.roster"));

        assert!(!Channel::is_valid("plugin.anything"));
        assert!(!Channel::is_valid("system..double"));
        assert!(!Channel::is_valid(".leading"));
        assert!(!Channel::is_valid("trailing."));
        assert!(!Channel::is_valid("Xmpp.message"));
        assert!(!Channel::is_valid("xmpp-message"));
        assert!(!Channel::is_valid(""));
    }

    #[test]
    fn channel_domain_and_display() {
        let channel = Channel::new("xmpp.subscription.request").unwrap();
        assert_eq!(channel.domain(), "xmpp");
        assert_eq!(channel.as_str(), "xmpp.subscription.request");
        assert_eq!(channel.to_string(), "xmpp.subscription.request");
    }

    #[test]
    fn channel_new_rejects_unknown_domain() {
        let result = Channel::new("gopher.message.received");
        assert!(matches!(result, Err(EventBusError::InvalidChannel(_))));
    }

    #[test]
    fn events_get_unique_ids() {
        let channel = Channel::new("system.connection.established").unwrap();
        let make = || {
            Event::new(
                channel.clone(),
                EventSource::Xmpp,
                EventPayload::ConnectionEstablished {
                    jid: "alice@example.com".into(),
                },
            )
        };
        assert_ne!(make().id, make().id);
    }

    fn message_event(id: &str) -> Event {
        Event::new(
            Channel::new("xmpp.message.received").unwrap(),
            EventSource::Xmpp,
            EventPayload::MessageReceived {
                message: ChatMessage {
                    id: id.to_string(),
                    from: "bob@example.com".into(),
                    display_name: "Bob".into(),
                    body: "hi".into(),
                    timestamp: Utc::now(),
                },
            },
        )
    }

    #[tokio::test]
    async fn publish_routes_to_matching_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("xmpp.**").unwrap();

        bus.publish(message_event("m1")).unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "xmpp.message.received");
    }

    #[tokio::test]
    async fn domain_subscriber_does_not_see_other_domains() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("system.**").unwrap();

        bus.publish(message_event("m1")).unwrap();

        let result = timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(result.is_err(), "xmpp event leaked to system subscriber");
    }

    #[tokio::test]
    async fn glob_filters_within_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("xmpp.roster.*").unwrap();

        bus.publish(message_event("m1")).unwrap();
        bus.publish(Event::new(
            Channel::new("xmpp.roster.updated").unwrap(),
            EventSource::Xmpp,
            EventPayload::RosterUpdated {
                entry: RosterEntry {
                    jid: "alice@example.com".into(),
                    name: Some("Alice".into()),
                    subscription: Subscription::Both,
                    groups: vec![],
                },
            },
        ))
        .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "xmpp.roster.updated");
    }

    #[tokio::test]
    async fn firehose_pattern_spans_all_domains() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("**").unwrap();

        bus.publish(Event::new(
            Channel::new("system.connection.lost").unwrap(),
            EventSource::Xmpp,
            EventPayload::ConnectionLost {
                reason: "eof".into(),
                will_retry: true,
            },
        ))
        .unwrap();
        bus.publish(message_event("m1")).unwrap();

        let mut channels = Vec::new();
        for _ in 0..2 {
            let event = timeout(Duration::from_millis(100), sub.recv())
                .await
                .expect("timed out")
                .unwrap();
            channels.push(event.channel.as_str().to_string());
        }
        channels.sort();
        assert_eq!(
            channels,
            vec!["system.connection.lost", "xmpp.message.received"]
        );
    }

    #[tokio::test]
    async fn publish_order_is_preserved_within_a_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("xmpp.**").unwrap();

        for i in 0..8 {
            bus.publish(message_event(&format!("m{i}"))).unwrap();
        }

        for i in 0..8 {
            let event = timeout(Duration::from_millis(100), sub.recv())
                .await
                .expect("timed out")
                .unwrap();
            let EventPayload::MessageReceived { message } = event.payload else {
                panic!("unexpected payload");
            };
            assert_eq!(message.id, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_the_event() {
        let bus = BroadcastEventBus::default();
        let mut first = bus.subscribe("xmpp.**").unwrap();
        let mut second = bus.subscribe("xmpp.**").unwrap();

        bus.publish(message_event("m1")).unwrap();

        let a = timeout(Duration::from_millis(100), first.recv())
            .await
            .expect("timed out")
            .unwrap();
        let b = timeout(Duration::from_millis(100), second.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = BroadcastEventBus::default();
        assert!(bus.publish(message_event("m1")).is_ok());
    }

    #[tokio::test]
    async fn subscribe_rejects_bad_patterns() {
        let bus = BroadcastEventBus::default();
        assert!(bus.subscribe("[oops").is_err());
        assert!(bus.subscribe("").is_err());
        assert!(matches!(
            bus.subscribe("gopher.hole"),
            Err(EventBusError::InvalidPattern(_))
        ));
    }

    #[tokio::test]
    async fn lagged_subscriber_sees_lag_error_then_recovers() {
        let bus = BroadcastEventBus::new(2);
        let mut sub = bus.subscribe("xmpp.**").unwrap();

        for i in 0..6 {
            bus.publish(message_event(&format!("m{i}"))).unwrap();
        }

        let result = sub.recv().await;
        assert!(matches!(result, Err(EventBusError::Lagged(_))));

        loop {
            match timeout(Duration::from_millis(10), sub.recv()).await {
                Ok(Ok(_)) | Ok(Err(EventBusError::Lagged(_))) => continue,
                _ => break,
            }
        }

        bus.publish(message_event("fresh")).unwrap();
        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out after lag")
            .unwrap();
        let EventPayload::MessageReceived { message } = event.payload else {
            panic!("unexpected payload");
        };
        assert_eq!(message.id, "fresh");
    }

    #[tokio::test]
    async fn closed_when_bus_dropped() {
        let mut sub;
        {
            let bus = BroadcastEventBus::default();
            sub = bus.subscribe("system.**").unwrap();
        }
        assert!(matches!(sub.recv().await, Err(EventBusError::ChannelClosed)));
    }
}
