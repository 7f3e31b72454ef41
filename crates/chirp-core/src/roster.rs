use serde::{Deserialize, Serialize};

/// One entry in the contact list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    /// Contact's bare JID, e.g. "bob@example.com".
    pub jid: String,

    /// Display name, if one is known.
    pub name: Option<String>,

    pub subscription: Subscription,

    pub groups: Vec<String>,
}

/// RFC 6121 roster subscription states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Subscription {
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }
}

impl std::str::FromStr for Subscription {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            "remove" => Subscription::Remove,
            _ => Subscription::None,
        })
    }
}

/// Read/write surface of the contact store.
///
/// The session manager and its processors only ever call
/// [`RosterStore::display_name`]; mutation is reserved for the roster and
/// vCard modules, which own the store's contents.
pub trait RosterStore: Send + Sync + 'static {
    /// Display name for a bare JID, `None` when the contact is unknown or
    /// has no name set. Must not block on I/O.
    fn display_name(&self, bare_jid: &str) -> Option<String>;

    /// Insert or replace an entry.
    fn upsert(&self, entry: RosterEntry);

    /// Remove an entry; removing an absent entry is a no-op.
    fn remove(&self, bare_jid: &str);

    /// Snapshot of all entries, unordered.
    fn entries(&self) -> Vec<RosterEntry>;
}
