mod caps;
mod message;
mod roster;
mod subscription;
mod vcard;

pub use caps::{CapsCache, CapsProcessor, ClientCaps, NS_CAPS};
pub use message::MessageProcessor;
pub use roster::RosterProcessor;
pub use subscription::SubscriptionProcessor;
pub use vcard::VcardProcessor;
