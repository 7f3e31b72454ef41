use std::str::FromStr;

use xmpp_parsers::{iq::Iq, message::Message, minidom::Element, presence::Presence};

use crate::error::PipelineError;

/// A typed top-level stanza: the only three elements a client stream carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Message(Box<Message>),
    Presence(Box<Presence>),
    Iq(Box<Iq>),
}

impl Stanza {
    /// Parse one stanza from raw wire bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, PipelineError> {
        let xml = std::str::from_utf8(raw)
            .map_err(|error| PipelineError::ParseFailed(format!("stanza is not UTF-8: {error}")))?;
        let trimmed = xml.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::ParseFailed("empty stanza payload".into()));
        }

        let element = Element::from_str(trimmed)
            .map_err(|error| PipelineError::ParseFailed(format!("malformed stanza XML: {error}")))?;
        Self::try_from(element)
    }

    /// Serialize back to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        let element = self.to_element();
        let mut out = Vec::new();
        element.write_to(&mut out).map_err(|error| {
            PipelineError::ProcessorFailed(format!(
                "failed to serialize <{}/> stanza: {error}",
                self.name()
            ))
        })?;
        Ok(out)
    }

    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Message(message) => (**message).clone().into(),
            Stanza::Presence(presence) => (**presence).clone().into(),
            Stanza::Iq(iq) => (**iq).clone().into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
        }
    }
}

impl TryFrom<Element> for Stanza {
    type Error = PipelineError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        match element.name() {
            "message" => Message::try_from(element)
                .map(|m| Stanza::Message(Box::new(m)))
                .map_err(|error| {
                    PipelineError::ParseFailed(format!("bad <message/> stanza: {error}"))
                }),
            "presence" => Presence::try_from(element)
                .map(|p| Stanza::Presence(Box::new(p)))
                .map_err(|error| {
                    PipelineError::ParseFailed(format!("bad <presence/> stanza: {error}"))
                }),
            "iq" => Iq::try_from(element)
                .map(|iq| Stanza::Iq(Box::new(iq)))
                .map_err(|error| PipelineError::ParseFailed(format!("bad <iq/> stanza: {error}"))),
            other => Err(PipelineError::ParseFailed(format!(
                "unsupported stanza element <{other}/>"
            ))),
        }
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Self {
        match stanza {
            Stanza::Message(message) => (*message).into(),
            Stanza::Presence(presence) => (*presence).into(),
            Stanza::Iq(iq) => (*iq).into(),
        }
    }
}
