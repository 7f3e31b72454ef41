//! Shared kernel for the Chirp chat client: typed events and the broadcast
//! bus, configuration, contact-store traits, and error types.

pub mod config;
pub mod error;
pub mod event;
pub mod roster;

pub use config::{Config, ConfigError, SessionProfile, SessionSettings};
pub use error::{CoreError, EventBusError};
pub use event::{
    BroadcastEventBus, Channel, ChatMessage, Event, EventBus, EventPayload, EventSource,
    EventSubscription,
};
pub use roster::{RosterEntry, RosterStore, Subscription};
