use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;
use xmpp_parsers::iq::Iq;
use xmpp_parsers::minidom::Element;
use xmpp_parsers::roster::Roster;

use chirp_core::event::EventBus;
use chirp_core::roster::RosterStore;

use crate::error::ConnectionError;
use crate::pipeline::StanzaPipeline;
use crate::processors::{CapsCache, CapsProcessor, ClientCaps, RosterProcessor, VcardProcessor};
use crate::stanza::Stanza;

/// A protocol extension with a lifecycle tied to the session's
/// `setup_stream`/`teardown_stream` cycle.
///
/// Contract: activated exactly once per setup cycle, deactivated exactly once
/// per teardown cycle, in reverse activation order; deactivating an inactive
/// module is a no-op.
pub trait SessionModule {
    fn name(&self) -> &'static str;

    fn is_active(&self) -> bool;

    fn activate(&mut self, pipeline: &mut StanzaPipeline);

    fn deactivate(&mut self, pipeline: &mut StanzaPipeline);

    /// Stanzas the module wants sent right after the session comes online.
    fn on_session_established(&mut self) -> Vec<Stanza> {
        Vec::new()
    }

    /// Extra payloads for outbound available presence.
    fn presence_payloads(&self) -> Vec<Element> {
        Vec::new()
    }
}

/// Retry policy for transport-level drops. Authentication failures never
/// reach this module.
pub struct ReconnectModule {
    max_attempts: u32,
    active: bool,
}

impl ReconnectModule {
    const INITIAL_DELAY_SECONDS: u64 = 1;
    const MAX_DELAY_SECONDS: u64 = 60;

    /// `max_attempts` of 0 retries forever.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            active: false,
        }
    }

    pub fn should_retry(&self, error: &ConnectionError, attempt: u32) -> bool {
        error.is_retryable() && (self.max_attempts == 0 || attempt <= self.max_attempts)
    }

    /// Exponential backoff: 1s, 2s, 4s, ... capped at 60s.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1);
        let seconds = 1_u64.checked_shl(shift).unwrap_or(u64::MAX).clamp(
            Self::INITIAL_DELAY_SECONDS,
            Self::MAX_DELAY_SECONDS,
        );
        Duration::from_secs(seconds)
    }
}

impl SessionModule for ReconnectModule {
    fn name(&self) -> &'static str {
        "reconnect"
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn activate(&mut self, _pipeline: &mut StanzaPipeline) {
        if self.active {
            warn!("reconnect module activated twice");
            return;
        }
        self.active = true;
    }

    fn deactivate(&mut self, _pipeline: &mut StanzaPipeline) {
        self.active = false;
    }
}

/// Contact-list handling: registers the roster processor and fetches the
/// roster after the session comes online.
pub struct RosterModule {
    event_bus: Arc<dyn EventBus>,
    store: Arc<dyn RosterStore>,
    auto_fetch: bool,
    active: bool,
}

impl RosterModule {
    pub fn new(event_bus: Arc<dyn EventBus>, store: Arc<dyn RosterStore>) -> Self {
        Self {
            event_bus,
            store,
            auto_fetch: true,
            active: false,
        }
    }
}

impl SessionModule for RosterModule {
    fn name(&self) -> &'static str {
        "roster"
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn activate(&mut self, pipeline: &mut StanzaPipeline) {
        if self.active {
            warn!("roster module activated twice");
            return;
        }
        pipeline.register(Box::new(RosterProcessor::new(
            self.event_bus.clone(),
            self.store.clone(),
        )));
        self.active = true;
    }

    fn deactivate(&mut self, pipeline: &mut StanzaPipeline) {
        if !self.active {
            return;
        }
        pipeline.unregister("roster");
        self.active = false;
    }

    fn on_session_established(&mut self) -> Vec<Stanza> {
        if !self.auto_fetch {
            return Vec::new();
        }
        let query = Roster {
            ver: None,
            items: vec![],
        };
        let iq = Iq::from_get(format!("roster-{}", Uuid::new_v4()), query);
        vec![Stanza::Iq(Box::new(iq))]
    }
}

/// vCard display-name enrichment (XEP-0054).
pub struct VcardModule {
    store: Arc<dyn RosterStore>,
    active: bool,
}

impl VcardModule {
    pub fn new(store: Arc<dyn RosterStore>) -> Self {
        Self {
            store,
            active: false,
        }
    }
}

impl SessionModule for VcardModule {
    fn name(&self) -> &'static str {
        "vcard"
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn activate(&mut self, pipeline: &mut StanzaPipeline) {
        if self.active {
            warn!("vcard module activated twice");
            return;
        }
        pipeline.register(Box::new(VcardProcessor::new(self.store.clone())));
        self.active = true;
    }

    fn deactivate(&mut self, pipeline: &mut StanzaPipeline) {
        if !self.active {
            return;
        }
        pipeline.unregister("vcard");
        self.active = false;
    }
}

/// Entity capabilities (XEP-0115): advertises this client's caps hash in
/// presence and resolves contacts' hashes to feature lists.
pub struct CapabilitiesModule {
    caps: ClientCaps,
    cache: Arc<CapsCache>,
    auto_fetch: bool,
    active: bool,
}

impl CapabilitiesModule {
    pub fn new(caps: ClientCaps) -> Self {
        Self {
            caps,
            cache: Arc::new(CapsCache::default()),
            auto_fetch: true,
            active: false,
        }
    }

    pub fn cache(&self) -> Arc<CapsCache> {
        self.cache.clone()
    }
}

impl SessionModule for CapabilitiesModule {
    fn name(&self) -> &'static str {
        "capabilities"
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn activate(&mut self, pipeline: &mut StanzaPipeline) {
        if self.active {
            warn!("capabilities module activated twice");
            return;
        }
        pipeline.register(Box::new(CapsProcessor::new(
            self.cache.clone(),
            self.auto_fetch,
        )));
        self.active = true;
    }

    fn deactivate(&mut self, pipeline: &mut StanzaPipeline) {
        if !self.active {
            return;
        }
        pipeline.unregister("caps");
        self.active = false;
    }

    fn presence_payloads(&self) -> Vec<Element> {
        vec![self.caps.presence_element()]
    }
}

/// The session's protocol extensions, owned as one unit so they are never
/// partially active.
pub struct ModuleSet {
    pub reconnect: ReconnectModule,
    pub roster: RosterModule,
    pub vcard: VcardModule,
    pub capabilities: CapabilitiesModule,
}

impl ModuleSet {
    pub fn new(
        event_bus: Arc<dyn EventBus>,
        store: Arc<dyn RosterStore>,
        max_reconnect_attempts: u32,
    ) -> Self {
        Self {
            reconnect: ReconnectModule::new(max_reconnect_attempts),
            roster: RosterModule::new(event_bus, store.clone()),
            vcard: VcardModule::new(store),
            capabilities: CapabilitiesModule::new(default_client_caps()),
        }
    }

    fn ordered(&mut self) -> [&mut dyn SessionModule; 4] {
        [
            &mut self.reconnect,
            &mut self.roster,
            &mut self.vcard,
            &mut self.capabilities,
        ]
    }

    pub fn activate_all(&mut self, pipeline: &mut StanzaPipeline) {
        for module in self.ordered() {
            module.activate(pipeline);
        }
    }

    /// Deactivate in reverse activation order.
    pub fn deactivate_all(&mut self, pipeline: &mut StanzaPipeline) {
        for module in self.ordered().into_iter().rev() {
            module.deactivate(pipeline);
        }
    }

    pub fn on_session_established(&mut self) -> Vec<Stanza> {
        self.ordered()
            .into_iter()
            .flat_map(|module| module.on_session_established())
            .collect()
    }

    pub fn presence_payloads(&self) -> Vec<Element> {
        let mut payloads = Vec::new();
        payloads.extend(self.reconnect.presence_payloads());
        payloads.extend(self.roster.presence_payloads());
        payloads.extend(self.vcard.presence_payloads());
        payloads.extend(self.capabilities.presence_payloads());
        payloads
    }
}

fn default_client_caps() -> ClientCaps {
    ClientCaps {
        node: "https://chirp.im".to_string(),
        identities: vec![("client".to_string(), "pc".to_string(), "Chirp".to_string())],
        features: vec![
            "http://jabber.org/protocol/disco#info".to_string(),
            "http://jabber.org/protocol/caps".to_string(),
            "jabber:iq:roster".to_string(),
            "vcard-temp".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use chirp_core::event::BroadcastEventBus;
    use chirp_core::roster::RosterEntry;

    use super::*;
    use crate::processors::NS_CAPS;

    struct NullStore;

    impl RosterStore for NullStore {
        fn display_name(&self, _bare_jid: &str) -> Option<String> {
            None
        }

        fn upsert(&self, _entry: RosterEntry) {}

        fn remove(&self, _bare_jid: &str) {}

        fn entries(&self) -> Vec<RosterEntry> {
            Vec::new()
        }
    }

    fn module_set(max_attempts: u32) -> ModuleSet {
        ModuleSet::new(
            Arc::new(BroadcastEventBus::default()),
            Arc::new(NullStore),
            max_attempts,
        )
    }

    #[test]
    fn reconnect_delay_is_exponential_and_capped() {
        let module = ReconnectModule::new(0);
        assert_eq!(module.delay(1), Duration::from_secs(1));
        assert_eq!(module.delay(2), Duration::from_secs(2));
        assert_eq!(module.delay(3), Duration::from_secs(4));
        assert_eq!(module.delay(6), Duration::from_secs(32));
        assert_eq!(module.delay(7), Duration::from_secs(60));
        assert_eq!(module.delay(40), Duration::from_secs(60));
    }

    #[test]
    fn reconnect_policy_respects_attempt_limit_and_error_class() {
        let bounded = ReconnectModule::new(2);
        assert!(bounded.should_retry(&ConnectionError::Timeout, 1));
        assert!(bounded.should_retry(&ConnectionError::Timeout, 2));
        assert!(!bounded.should_retry(&ConnectionError::Timeout, 3));
        assert!(!bounded.should_retry(
            &ConnectionError::AuthenticationFailed("bad password".into()),
            1
        ));

        let unlimited = ReconnectModule::new(0);
        assert!(unlimited.should_retry(&ConnectionError::Timeout, 10_000));
    }

    #[test]
    fn activation_registers_every_processor_exactly_once() {
        let mut modules = module_set(0);
        let mut pipeline = StanzaPipeline::new();

        modules.activate_all(&mut pipeline);
        assert_eq!(pipeline.len(), 3);
        for name in ["roster", "vcard", "caps"] {
            assert!(pipeline.is_registered(name), "{name} missing");
        }
        assert!(modules.reconnect.is_active());

        // A second activation pass must not duplicate processors.
        modules.activate_all(&mut pipeline);
        assert_eq!(pipeline.len(), 3);
    }

    #[test]
    fn deactivation_unregisters_and_is_idempotent() {
        let mut modules = module_set(0);
        let mut pipeline = StanzaPipeline::new();

        modules.activate_all(&mut pipeline);
        modules.deactivate_all(&mut pipeline);
        assert!(pipeline.is_empty());
        assert!(!modules.roster.is_active());

        modules.deactivate_all(&mut pipeline);
        assert!(pipeline.is_empty());
    }

    #[test]
    fn session_establishment_yields_a_roster_fetch() {
        let mut modules = module_set(0);
        let stanzas = modules.on_session_established();
        assert_eq!(stanzas.len(), 1);
        assert_eq!(stanzas[0].name(), "iq");
    }

    #[test]
    fn presence_payloads_include_the_caps_element() {
        let modules = module_set(0);
        let payloads = modules.presence_payloads();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].is("c", NS_CAPS));
    }
}
