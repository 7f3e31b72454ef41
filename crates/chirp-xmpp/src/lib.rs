//! XMPP session layer for Chirp: the connection state machine, protocol
//! modules (reconnect, roster, vCard, capabilities), SASL, and the inbound
//! stanza pipeline.

pub mod auth;
pub mod error;
pub mod modules;
pub mod pipeline;
pub mod processors;
pub mod session;
pub mod stanza;
pub mod transport;

pub use auth::AuthMechanism;
pub use error::{ConnectionError, PipelineError};
pub use modules::{
    CapabilitiesModule, ModuleSet, ReconnectModule, RosterModule, SessionModule, VcardModule,
};
pub use pipeline::{ProcessorContext, ProcessorOutcome, StanzaPipeline, StanzaProcessor};
pub use session::{ConnectionState, SessionManager};
pub use stanza::Stanza;
#[cfg(feature = "native")]
pub use transport::TcpTransport;
pub use transport::XmppTransport;
