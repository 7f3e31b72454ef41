use std::sync::Arc;

use tracing::{debug, warn};
use xmpp_parsers::{iq::Iq, ns, roster::Roster};

use chirp_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use chirp_core::roster::{RosterEntry, RosterStore, Subscription};

use crate::pipeline::{ProcessorContext, ProcessorOutcome, StanzaProcessor};
use crate::stanza::Stanza;

/// Applies roster IQ results and pushes to the contact store and republishes
/// them as roster events. Registered by the roster module; this processor is
/// the only writer of full roster entries.
pub struct RosterProcessor {
    event_bus: Arc<dyn EventBus>,
    store: Arc<dyn RosterStore>,
}

impl RosterProcessor {
    pub fn new(event_bus: Arc<dyn EventBus>, store: Arc<dyn RosterStore>) -> Self {
        Self { event_bus, store }
    }

    fn publish(&self, channel: &str, payload: EventPayload) {
        let Ok(channel) = Channel::new(channel) else {
            return;
        };
        let _ = self
            .event_bus
            .publish(Event::new(channel, EventSource::Xmpp, payload));
    }
}

impl StanzaProcessor for RosterProcessor {
    fn name(&self) -> &'static str {
        "roster"
    }

    fn process(&self, stanza: &mut Stanza, _ctx: &mut ProcessorContext) -> ProcessorOutcome {
        let Stanza::Iq(iq) = stanza else {
            return ProcessorOutcome::Continue;
        };

        match iq.as_ref() {
            Iq::Result {
                payload: Some(payload),
                ..
            } => {
                if !payload.is("query", ns::ROSTER) {
                    return ProcessorOutcome::Continue;
                }
                let Ok(roster) = Roster::try_from(payload.clone()) else {
                    warn!("unparseable roster result payload");
                    return ProcessorOutcome::Drop;
                };

                let entries: Vec<RosterEntry> = roster.items.iter().map(convert_item).collect();
                debug!(count = entries.len(), "roster received");
                for entry in &entries {
                    self.store.upsert(entry.clone());
                }
                self.publish(
                    "xmpp.roster.received",
                    EventPayload::RosterReceived { entries },
                );
                ProcessorOutcome::Drop
            }
            Iq::Set { payload, .. } => {
                if !payload.is("query", ns::ROSTER) {
                    return ProcessorOutcome::Continue;
                }
                let Ok(roster) = Roster::try_from(payload.clone()) else {
                    warn!("unparseable roster push payload");
                    return ProcessorOutcome::Drop;
                };

                for item in &roster.items {
                    let entry = convert_item(item);
                    if entry.subscription == Subscription::Remove {
                        debug!(jid = %entry.jid, "roster entry removed");
                        self.store.remove(&entry.jid);
                        self.publish(
                            "xmpp.roster.removed",
                            EventPayload::RosterRemoved { jid: entry.jid },
                        );
                    } else {
                        debug!(jid = %entry.jid, "roster entry updated");
                        self.store.upsert(entry.clone());
                        self.publish("xmpp.roster.updated", EventPayload::RosterUpdated { entry });
                    }
                }
                ProcessorOutcome::Drop
            }
            _ => ProcessorOutcome::Continue,
        }
    }

    fn priority(&self) -> i32 {
        20
    }
}

fn convert_item(item: &xmpp_parsers::roster::Item) -> RosterEntry {
    RosterEntry {
        jid: item.jid.to_string(),
        name: item.name.clone(),
        subscription: match item.subscription {
            xmpp_parsers::roster::Subscription::None => Subscription::None,
            xmpp_parsers::roster::Subscription::To => Subscription::To,
            xmpp_parsers::roster::Subscription::From => Subscription::From,
            xmpp_parsers::roster::Subscription::Both => Subscription::Both,
            xmpp_parsers::roster::Subscription::Remove => Subscription::Remove,
        },
        groups: item.groups.iter().map(|g| g.0.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::RwLock;
    use std::time::Duration;

    use chirp_core::event::BroadcastEventBus;
    use tokio::time::timeout;

    use super::*;

    #[derive(Default)]
    struct MemStore(RwLock<HashMap<String, RosterEntry>>);

    impl RosterStore for MemStore {
        fn display_name(&self, bare_jid: &str) -> Option<String> {
            self.0.read().unwrap().get(bare_jid).and_then(|e| e.name.clone())
        }

        fn upsert(&self, entry: RosterEntry) {
            self.0.write().unwrap().insert(entry.jid.clone(), entry);
        }

        fn remove(&self, bare_jid: &str) {
            self.0.write().unwrap().remove(bare_jid);
        }

        fn entries(&self) -> Vec<RosterEntry> {
            self.0.read().unwrap().values().cloned().collect()
        }
    }

    const ROSTER_RESULT_XML: &[u8] = b"<iq xmlns='jabber:client' type='result' id='r1'>\
        <query xmlns='jabber:iq:roster'>\
            <item jid='alice@example.com' name='Alice' subscription='both'>\
                <group>Friends</group>\
            </item>\
            <item jid='bob@example.com' subscription='to'/>\
        </query>\
    </iq>";

    const ROSTER_PUSH_XML: &[u8] = b"<iq xmlns='jabber:client' type='set' id='p1'>\
        <query xmlns='jabber:iq:roster'>\
            <item jid='carol@example.com' name='Carol' subscription='from'/>\
        </query>\
    </iq>";

    const ROSTER_REMOVE_XML: &[u8] = b"<iq xmlns='jabber:client' type='set' id='p2'>\
        <query xmlns='jabber:iq:roster'>\
            <item jid='alice@example.com' subscription='remove'/>\
        </query>\
    </iq>";

    const PING_IQ_XML: &[u8] =
        b"<iq xmlns='jabber:client' type='get' id='ping'><ping xmlns='urn:xmpp:ping'/></iq>";

    fn setup() -> (RosterProcessor, Arc<MemStore>, Arc<BroadcastEventBus>) {
        let bus = Arc::new(BroadcastEventBus::default());
        let store = Arc::new(MemStore::default());
        let processor = RosterProcessor::new(bus.clone(), store.clone());
        (processor, store, bus)
    }

    fn feed(processor: &RosterProcessor, raw: &[u8]) -> ProcessorOutcome {
        let mut stanza = Stanza::parse(raw).unwrap();
        processor.process(&mut stanza, &mut ProcessorContext::new())
    }

    #[tokio::test]
    async fn roster_result_fills_store_and_emits_event() {
        let (processor, store, bus) = setup();
        let mut sub = bus.subscribe("xmpp.roster.received").unwrap();

        let outcome = feed(&processor, ROSTER_RESULT_XML);
        assert!(matches!(outcome, ProcessorOutcome::Drop));

        assert_eq!(store.display_name("alice@example.com"), Some("Alice".into()));
        assert_eq!(store.display_name("bob@example.com"), None);
        assert_eq!(store.entries().len(), 2);

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out waiting for roster event")
            .unwrap();
        let EventPayload::RosterReceived { entries } = event.payload else {
            panic!("unexpected payload");
        };
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn roster_push_updates_store() {
        let (processor, store, bus) = setup();
        let mut sub = bus.subscribe("xmpp.roster.updated").unwrap();

        feed(&processor, ROSTER_PUSH_XML);

        assert_eq!(store.display_name("carol@example.com"), Some("Carol".into()));
        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out waiting for update event")
            .unwrap();
        let EventPayload::RosterUpdated { entry } = event.payload else {
            panic!("unexpected payload");
        };
        assert_eq!(entry.subscription, Subscription::From);
    }

    #[tokio::test]
    async fn roster_remove_push_clears_the_entry() {
        let (processor, store, bus) = setup();
        let mut sub = bus.subscribe("xmpp.roster.removed").unwrap();

        feed(&processor, ROSTER_RESULT_XML);
        assert!(store.display_name("alice@example.com").is_some());

        feed(&processor, ROSTER_REMOVE_XML);
        assert!(store.display_name("alice@example.com").is_none());

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out waiting for remove event")
            .unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::RosterRemoved { jid } if jid == "alice@example.com"
        ));
    }

    #[tokio::test]
    async fn unrelated_iqs_pass_through() {
        let (processor, store, _bus) = setup();
        let outcome = feed(&processor, PING_IQ_XML);
        assert!(matches!(outcome, ProcessorOutcome::Continue));
        assert!(store.entries().is_empty());
    }
}
