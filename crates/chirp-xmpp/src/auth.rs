use std::collections::HashSet;

use sasl::client::Mechanism as SaslClientMechanism;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::common::Credentials;
use sasl::common::scram::{Sha1, Sha256};

use crate::error::ConnectionError;

/// SASL mechanisms this client can run, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    ScramSha256,
    ScramSha1,
    Plain,
}

impl AuthMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha256 => "SCRAM-SHA-256",
            AuthMechanism::ScramSha1 => "SCRAM-SHA-1",
            AuthMechanism::Plain => "PLAIN",
        }
    }
}

impl std::fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const PREFERENCE: &[AuthMechanism] = &[
    AuthMechanism::ScramSha256,
    AuthMechanism::ScramSha1,
    AuthMechanism::Plain,
];

/// Pick the strongest mechanism both sides support.
pub fn select_mechanism(server_offers: &HashSet<String>) -> Option<AuthMechanism> {
    PREFERENCE
        .iter()
        .find(|mechanism| server_offers.contains(mechanism.name()))
        .copied()
}

fn build_mechanism(
    selected: AuthMechanism,
    credentials: &Credentials,
) -> Result<Box<dyn SaslClientMechanism + Send>, ConnectionError> {
    let failed = |error| {
        ConnectionError::AuthenticationFailed(format!(
            "failed to initialize {selected}: {error:?}"
        ))
    };
    match selected {
        AuthMechanism::ScramSha256 => Scram::<Sha256>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn SaslClientMechanism + Send>)
            .map_err(failed),
        AuthMechanism::ScramSha1 => Scram::<Sha1>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn SaslClientMechanism + Send>)
            .map_err(failed),
        AuthMechanism::Plain => Plain::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn SaslClientMechanism + Send>)
            .map_err(failed),
    }
}

#[cfg(feature = "native")]
pub use native::negotiate;

#[cfg(feature = "native")]
mod native {
    use std::collections::HashSet;
    use std::str::FromStr;

    use futures::StreamExt;
    use sasl::common::{ChannelBinding, Credentials};
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_xmpp::Packet;
    use tokio_xmpp::parsers::{
        bind::{BindQuery, BindResponse},
        iq::{Iq, IqType},
        sasl::{Auth, Challenge, Failure, Mechanism as WireMechanism, Response, Success},
    };
    use tokio_xmpp::xmpp_stream::XMPPStream;
    use tracing::{debug, warn};

    use super::{build_mechanism, select_mechanism};
    use crate::error::ConnectionError;

    const BIND_REQUEST_ID: &str = "session-bind";

    fn map_failure(failure: &Failure) -> ConnectionError {
        let condition = format!("{:?}", failure.defined_condition);
        match failure.texts.values().next() {
            Some(text) if !text.is_empty() => {
                ConnectionError::AuthenticationFailed(format!("{condition}: {text}"))
            }
            _ => ConnectionError::AuthenticationFailed(condition),
        }
    }

    /// Run SASL and resource binding over a freshly negotiated stream,
    /// returning the raw inner stream ready for stanza traffic.
    pub async fn negotiate<S>(
        mut stream: XMPPStream<S>,
        username: &str,
        password: &str,
    ) -> Result<S, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let offered: HashSet<String> = stream
            .stream_features
            .sasl_mechanisms()
            .map_err(|_| {
                ConnectionError::AuthenticationFailed(
                    "server advertised no SASL mechanisms".to_string(),
                )
            })?
            .collect();
        debug!(mechanisms = ?offered, "server SASL mechanisms");

        let selected = select_mechanism(&offered).ok_or_else(|| {
            ConnectionError::AuthenticationFailed(format!(
                "no mutually supported SASL mechanism; server offers: {}",
                offered.iter().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        debug!(mechanism = %selected, "selected SASL mechanism");

        let credentials = Credentials::default()
            .with_username(username)
            .with_password(password)
            .with_channel_binding(ChannelBinding::Unsupported);
        let mut mechanism = build_mechanism(selected, &credentials)?;

        let wire_name = WireMechanism::from_str(mechanism.name()).map_err(|error| {
            ConnectionError::AuthenticationFailed(format!("bad SASL mechanism name: {error}"))
        })?;
        let initial = mechanism.initial();
        stream
            .send_stanza(Auth {
                mechanism: wire_name,
                data: initial,
            })
            .await
            .map_err(|error| {
                ConnectionError::StreamError(format!("failed to send SASL auth: {error}"))
            })?;

        loop {
            match stream.next().await {
                Some(Ok(Packet::Stanza(stanza))) => {
                    if let Ok(challenge) = Challenge::try_from(stanza.clone()) {
                        let response = mechanism.response(&challenge.data).map_err(|error| {
                            ConnectionError::AuthenticationFailed(format!(
                                "SASL challenge failed: {error:?}"
                            ))
                        })?;
                        stream
                            .send_stanza(Response { data: response })
                            .await
                            .map_err(|error| {
                                ConnectionError::StreamError(format!(
                                    "failed to send SASL response: {error}"
                                ))
                            })?;
                    } else if let Ok(success) = Success::try_from(stanza.clone()) {
                        if let Err(error) = mechanism.success(&success.data) {
                            warn!(?error, "server signature verification failed");
                            return Err(ConnectionError::AuthenticationFailed(format!(
                                "server signature verification failed: {error:?}"
                            )));
                        }
                        debug!("SASL authentication succeeded");
                        return bind_resource(stream).await;
                    } else if let Ok(failure) = Failure::try_from(stanza) {
                        debug!(condition = ?failure.defined_condition, "SASL failure");
                        return Err(map_failure(&failure));
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    return Err(ConnectionError::StreamError(format!(
                        "stream error during SASL negotiation: {error}"
                    )));
                }
                None => {
                    return Err(ConnectionError::TransportError(
                        "connection closed during SASL negotiation".to_string(),
                    ));
                }
            }
        }
    }

    async fn bind_resource<S>(stream: XMPPStream<S>) -> Result<S, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = stream.restart().await.map_err(|error| {
            ConnectionError::StreamError(format!("stream restart after SASL failed: {error}"))
        })?;

        if !stream.stream_features.can_bind() {
            return Ok(stream.into_inner());
        }

        let resource = stream.jid.resource().map(|r| r.to_string());
        let bind_iq = Iq::from_set(BIND_REQUEST_ID, BindQuery::new(resource));
        stream.send_stanza(bind_iq).await.map_err(|error| {
            ConnectionError::StreamError(format!("failed to send resource bind: {error}"))
        })?;

        loop {
            match stream.next().await {
                Some(Ok(Packet::Stanza(stanza))) => {
                    let Ok(iq) = Iq::try_from(stanza) else {
                        continue;
                    };
                    if iq.id != BIND_REQUEST_ID {
                        continue;
                    }
                    match iq.payload {
                        IqType::Result(payload) => {
                            if let Some(payload) = payload {
                                let bound = BindResponse::try_from(payload).map_err(|error| {
                                    ConnectionError::StreamError(format!(
                                        "bad resource bind response: {error}"
                                    ))
                                })?;
                                stream.jid = bound.into();
                            }
                            return Ok(stream.into_inner());
                        }
                        _ => {
                            return Err(ConnectionError::StreamError(
                                "server rejected resource binding".to_string(),
                            ));
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    return Err(ConnectionError::StreamError(format!(
                        "stream error during resource binding: {error}"
                    )));
                }
                None => {
                    return Err(ConnectionError::TransportError(
                        "connection closed during resource binding".to_string(),
                    ));
                }
            }
        }
    }
}
