use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use tracing::debug;
use uuid::Uuid;
use xmpp_parsers::disco::{DiscoInfoQuery, DiscoInfoResult};
use xmpp_parsers::iq::Iq;
use xmpp_parsers::minidom::Element;
use xmpp_parsers::minidom::rxml::xml_ncname;

use crate::pipeline::{ProcessorContext, ProcessorOutcome, StanzaProcessor};
use crate::stanza::Stanza;

/// XEP-0115 Entity Capabilities namespace.
pub const NS_CAPS: &str = "http://jabber.org/protocol/caps";

/// This client's advertised capabilities: the identity and feature list the
/// XEP-0115 verification string is computed over.
#[derive(Debug, Clone)]
pub struct ClientCaps {
    /// Node URI identifying the software, e.g. "https://chirp.im".
    pub node: String,
    /// (category, type, name) triples, usually just one "client/pc" entry.
    pub identities: Vec<(String, String, String)>,
    /// Feature vars, e.g. "http://jabber.org/protocol/disco#info".
    pub features: Vec<String>,
}

impl ClientCaps {
    /// Verification string per XEP-0115 §5.1: sorted identities as
    /// `category/type/lang/name<`, then sorted features as `var<`,
    /// SHA-1 hashed and base64 encoded.
    pub fn verification(&self) -> String {
        let mut identities: Vec<String> = self
            .identities
            .iter()
            .map(|(category, type_, name)| format!("{category}/{type_}//{name}"))
            .collect();
        identities.sort();

        let mut features = self.features.clone();
        features.sort();

        let mut input = String::new();
        for identity in identities {
            input.push_str(&identity);
            input.push('<');
        }
        for feature in features {
            input.push_str(&feature);
            input.push('<');
        }

        let digest = Sha1::digest(input.as_bytes());
        BASE64.encode(digest)
    }

    /// The `<c/>` element to attach to outbound available presence.
    pub fn presence_element(&self) -> Element {
        Element::builder("c", NS_CAPS)
            .attr(xml_ncname!("hash").to_owned(), "sha-1")
            .attr(xml_ncname!("node").to_owned(), self.node.as_str())
            .attr(xml_ncname!("ver").to_owned(), self.verification())
            .build()
    }
}

/// Cache of verification-string → feature-list mappings learned from
/// contacts' presence and disco#info responses.
#[derive(Default)]
pub struct CapsCache {
    known: RwLock<HashMap<String, Vec<String>>>,
    pending: RwLock<HashSet<String>>,
}

impl CapsCache {
    pub fn features_for(&self, ver: &str) -> Option<Vec<String>> {
        self.known.read().unwrap().get(ver).cloned()
    }

    fn is_known_or_pending(&self, ver: &str) -> bool {
        self.known.read().unwrap().contains_key(ver)
            || self.pending.read().unwrap().contains(ver)
    }

    fn mark_pending(&self, ver: &str) {
        self.pending.write().unwrap().insert(ver.to_string());
    }

    fn insert(&self, ver: &str, features: Vec<String>) {
        self.pending.write().unwrap().remove(ver);
        self.known.write().unwrap().insert(ver.to_string(), features);
    }
}

/// Tracks contact capabilities (XEP-0115): reads `<c/>` elements from
/// presence, resolves unknown verification strings with a disco#info query,
/// and caches the resulting feature lists.
pub struct CapsProcessor {
    cache: Arc<CapsCache>,
    auto_fetch: bool,
}

impl CapsProcessor {
    pub fn new(cache: Arc<CapsCache>, auto_fetch: bool) -> Self {
        Self { cache, auto_fetch }
    }
}

impl StanzaProcessor for CapsProcessor {
    fn name(&self) -> &'static str {
        "caps"
    }

    fn process(&self, stanza: &mut Stanza, ctx: &mut ProcessorContext) -> ProcessorOutcome {
        match stanza {
            Stanza::Presence(presence) => {
                let Some(caps) = presence.payloads.iter().find(|el| el.is("c", NS_CAPS)) else {
                    return ProcessorOutcome::Continue;
                };
                let (Some(node), Some(ver)) = (caps.attr("node"), caps.attr("ver")) else {
                    return ProcessorOutcome::Continue;
                };
                let Some(sender) = presence.from.clone() else {
                    return ProcessorOutcome::Continue;
                };

                if self.auto_fetch && !self.cache.is_known_or_pending(ver) {
                    debug!(from = %sender, ver = %ver, "querying unknown caps hash");
                    self.cache.mark_pending(ver);
                    let query = DiscoInfoQuery {
                        node: Some(format!("{node}#{ver}")),
                    };
                    let iq =
                        Iq::from_get(format!("caps-{}", Uuid::new_v4()), query).with_to(sender);
                    ctx.push_reply(Stanza::Iq(Box::new(iq)));
                }
                ProcessorOutcome::Continue
            }
            Stanza::Iq(iq) => {
                let Iq::Result {
                    payload: Some(payload),
                    ..
                } = iq.as_ref()
                else {
                    return ProcessorOutcome::Continue;
                };
                let Ok(info) = DiscoInfoResult::try_from(payload.clone()) else {
                    return ProcessorOutcome::Continue;
                };
                let Some(ver) = info
                    .node
                    .as_deref()
                    .and_then(|node| node.rsplit_once('#'))
                    .map(|(_, ver)| ver.to_string())
                else {
                    return ProcessorOutcome::Continue;
                };

                let features: Vec<String> =
                    info.features.iter().map(|f| f.var.clone()).collect();
                debug!(ver = %ver, count = features.len(), "caps features cached");
                self.cache.insert(&ver, features);
                ProcessorOutcome::Drop
            }
            _ => ProcessorOutcome::Continue,
        }
    }

    fn priority(&self) -> i32 {
        40
    }
}
