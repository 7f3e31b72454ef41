//! In-memory [`RosterStore`] backend.
//!
//! The storage choice is abstracted behind the trait in `chirp-core`; this
//! crate provides the default map-backed store shared between the session's
//! processors (readers) and the roster/vCard modules (writers).

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use chirp_core::roster::{RosterEntry, RosterStore};

#[derive(Debug, Default)]
pub struct InMemoryRosterStore {
    entries: RwLock<HashMap<String, RosterEntry>>,
}

impl InMemoryRosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl RosterStore for InMemoryRosterStore {
    fn display_name(&self, bare_jid: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap()
            .get(bare_jid)
            .and_then(|entry| entry.name.clone())
    }

    fn upsert(&self, entry: RosterEntry) {
        debug!(jid = %entry.jid, "roster entry stored");
        self.entries
            .write()
            .unwrap()
            .insert(entry.jid.clone(), entry);
    }

    fn remove(&self, bare_jid: &str) {
        if self.entries.write().unwrap().remove(bare_jid).is_some() {
            debug!(jid = %bare_jid, "roster entry removed");
        }
    }

    fn entries(&self) -> Vec<RosterEntry> {
        self.entries.read().unwrap().values().cloned().collect()
    }
}
