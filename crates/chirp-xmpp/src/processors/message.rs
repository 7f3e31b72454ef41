use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;
use xmpp_parsers::message::{Id, Lang, Message, MessageType};

use chirp_core::event::{Channel, ChatMessage, Event, EventBus, EventPayload, EventSource};
use chirp_core::roster::RosterStore;

use crate::pipeline::{ProcessorContext, ProcessorOutcome, StanzaProcessor};
use crate::stanza::Stanza;

/// Classifies inbound one-to-one chat messages and publishes them as
/// [`EventPayload::MessageReceived`], with the sender's display name resolved
/// from the roster (empty string when unknown).
///
/// With `auto_echo` set, every inbound message that carries a body is echoed
/// verbatim back to its sender. This is demonstration behavior inherited from
/// the sample client, kept behind the config flag.
pub struct MessageProcessor {
    event_bus: Arc<dyn EventBus>,
    roster: Arc<dyn RosterStore>,
    auto_echo: bool,
}

impl MessageProcessor {
    pub fn new(
        event_bus: Arc<dyn EventBus>,
        roster: Arc<dyn RosterStore>,
        auto_echo: bool,
    ) -> Self {
        Self {
            event_bus,
            roster,
            auto_echo,
        }
    }
}

impl StanzaProcessor for MessageProcessor {
    fn name(&self) -> &'static str {
        "message"
    }

    fn process(&self, stanza: &mut Stanza, ctx: &mut ProcessorContext) -> ProcessorOutcome {
        let Stanza::Message(msg) = stanza else {
            return ProcessorOutcome::Continue;
        };

        let body = msg.get_best_body(vec![]).map(|(_, body)| body.clone());
        let sender = msg.from.clone();

        if msg.type_ == MessageType::Chat {
            if let Some(body) = &body {
                let from = sender
                    .as_ref()
                    .map(|j| j.to_bare().to_string())
                    .unwrap_or_default();
                let display_name = self.roster.display_name(&from).unwrap_or_default();

                debug!(from = %from, "chat message received");

                let _ = self.event_bus.publish(Event::new(
                    Channel::new("xmpp.message.received").unwrap(),
                    EventSource::Xmpp,
                    EventPayload::MessageReceived {
                        message: ChatMessage {
                            id: msg.id.as_ref().map(|id| id.0.clone()).unwrap_or_default(),
                            from,
                            display_name,
                            body: body.clone(),
                            timestamp: Utc::now(),
                        },
                    },
                ));
            }
        }

        if self.auto_echo {
            if let (Some(to), Some(body)) = (sender, body) {
                let mut echo = Message::new_with_type(MessageType::Chat, Some(to));
                echo.id = Some(Id(Uuid::new_v4().to_string()));
                echo.bodies.insert(Lang::new(), body);
                ctx.push_reply(Stanza::Message(Box::new(echo)));
            }
        }

        ProcessorOutcome::Continue
    }

    fn priority(&self) -> i32 {
        10
    }
}
