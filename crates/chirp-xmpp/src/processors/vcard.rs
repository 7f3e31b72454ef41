use std::sync::Arc;

use tracing::debug;
use xmpp_parsers::iq::Iq;

use chirp_core::roster::RosterStore;

use crate::pipeline::{ProcessorContext, ProcessorOutcome, StanzaProcessor};
use crate::stanza::Stanza;

const NS_VCARD: &str = "vcard-temp";

/// Fills missing roster display names from inbound vcard-temp results
/// (XEP-0054): a contact without a roster name gets their vCard
/// `NICKNAME`/`FN`. Avatar photos are ignored.
pub struct VcardProcessor {
    store: Arc<dyn RosterStore>,
}

impl VcardProcessor {
    pub fn new(store: Arc<dyn RosterStore>) -> Self {
        Self { store }
    }
}

impl StanzaProcessor for VcardProcessor {
    fn name(&self) -> &'static str {
        "vcard"
    }

    fn process(&self, stanza: &mut Stanza, _ctx: &mut ProcessorContext) -> ProcessorOutcome {
        let Stanza::Iq(iq) = stanza else {
            return ProcessorOutcome::Continue;
        };
        let Iq::Result {
            from,
            payload: Some(payload),
            ..
        } = iq.as_ref()
        else {
            return ProcessorOutcome::Continue;
        };
        if !payload.is("vCard", NS_VCARD) {
            return ProcessorOutcome::Continue;
        }

        let Some(sender) = from.as_ref().map(|j| j.to_bare().to_string()) else {
            return ProcessorOutcome::Drop;
        };

        let nickname = ["NICKNAME", "FN"].iter().find_map(|field| {
            payload
                .get_child(*field, NS_VCARD)
                .map(|el| el.text())
                .filter(|text| !text.is_empty())
        });
        let Some(nickname) = nickname else {
            return ProcessorOutcome::Drop;
        };

        let entry = self
            .store
            .entries()
            .into_iter()
            .find(|entry| entry.jid == sender);
        if let Some(mut entry) = entry {
            if entry.name.is_none() {
                debug!(jid = %sender, name = %nickname, "vCard filled in display name");
                entry.name = Some(nickname);
                self.store.upsert(entry);
            }
        }

        ProcessorOutcome::Drop
    }

    fn priority(&self) -> i32 {
        30
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::RwLock;

    use chirp_core::roster::{RosterEntry, Subscription};

    use super::*;

    #[derive(Default)]
    struct MemStore(RwLock<HashMap<String, RosterEntry>>);

    impl MemStore {
        fn seed(&self, jid: &str, name: Option<&str>) {
            self.upsert(RosterEntry {
                jid: jid.to_string(),
                name: name.map(String::from),
                subscription: Subscription::Both,
                groups: vec![],
            });
        }
    }

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

    const VCARD_RESULT_XML: &[u8] = b"<iq xmlns='jabber:client' type='result' id='v1' \
        from='bob@example.com'>\
        <vCard xmlns='vcard-temp'>\
            <FN>Bob Dobbs</FN>\
            <NICKNAME>Bob</NICKNAME>\
        </vCard>\
    </iq>";

    fn feed(processor: &VcardProcessor, raw: &[u8]) -> ProcessorOutcome {
        let mut stanza = Stanza::parse(raw).unwrap();
        processor.process(&mut stanza, &mut ProcessorContext::new())
    }

    #[test]
    fn vcard_fills_missing_display_name() {
        let store = Arc::new(MemStore::default());
        store.seed("bob@example.com", None);
        let processor = VcardProcessor::new(store.clone());

        let outcome = feed(&processor, VCARD_RESULT_XML);
        assert!(matches!(outcome, ProcessorOutcome::Drop));
        assert_eq!(store.display_name("bob@example.com"), Some("Bob".into()));
    }

    #[test]
    fn existing_display_name_is_not_overwritten() {
        let store = Arc::new(MemStore::default());
        store.seed("bob@example.com", Some("Bobby"));
        let processor = VcardProcessor::new(store.clone());

        feed(&processor, VCARD_RESULT_XML);
        assert_eq!(store.display_name("bob@example.com"), Some("Bobby".into()));
    }

    #[test]
    fn vcard_from_a_stranger_is_ignored() {
        let store = Arc::new(MemStore::default());
        let processor = VcardProcessor::new(store.clone());

        feed(&processor, VCARD_RESULT_XML);
        assert!(store.entries().is_empty());
    }

    #[test]
    fn non_vcard_iqs_pass_through() {
        let store = Arc::new(MemStore::default());
        let processor = VcardProcessor::new(store);

        let outcome = feed(
            &processor,
            b"<iq xmlns='jabber:client' type='result' id='x1' from='bob@example.com'/>",
        );
        assert!(matches!(outcome, ProcessorOutcome::Continue));
    }
}
