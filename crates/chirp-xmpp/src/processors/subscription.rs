use std::sync::Arc;

use tracing::debug;
use xmpp_parsers::presence::Type as PresenceType;

use chirp_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use chirp_core::roster::RosterStore;

use crate::pipeline::{ProcessorContext, ProcessorOutcome, StanzaProcessor};
use crate::stanza::Stanza;

/// Turns inbound presence-subscription requests into
/// [`EventPayload::SubscriptionRequest`] events.
///
/// A request whose sender identity or resolved display name is empty is
/// dropped without an event; there is nothing a consumer could render.
pub struct SubscriptionProcessor {
    event_bus: Arc<dyn EventBus>,
    roster: Arc<dyn RosterStore>,
}

impl SubscriptionProcessor {
    pub fn new(event_bus: Arc<dyn EventBus>, roster: Arc<dyn RosterStore>) -> Self {
        Self { event_bus, roster }
    }
}

impl StanzaProcessor for SubscriptionProcessor {
    fn name(&self) -> &'static str {
        "subscription"
    }

    fn process(&self, stanza: &mut Stanza, _ctx: &mut ProcessorContext) -> ProcessorOutcome {
        let Stanza::Presence(presence) = stanza else {
            return ProcessorOutcome::Continue;
        };
        if presence.type_ != PresenceType::Subscribe {
            return ProcessorOutcome::Continue;
        }

        let from = presence
            .from
            .as_ref()
            .map(|j| j.to_bare().to_string())
            .unwrap_or_default();
        let display_name = self.roster.display_name(&from).unwrap_or_default();

        if from.is_empty() || display_name.is_empty() {
            debug!(from = %from, "dropping subscription request without a resolvable name");
            return ProcessorOutcome::Drop;
        }

        debug!(from = %from, "subscription request received");
        let _ = self.event_bus.publish(Event::new(
            Channel::new("xmpp.subscription.request").unwrap(),
            EventSource::Xmpp,
            EventPayload::SubscriptionRequest { from, display_name },
        ));

        ProcessorOutcome::Drop
    }

    fn priority(&self) -> i32 {
        10
    }
}
