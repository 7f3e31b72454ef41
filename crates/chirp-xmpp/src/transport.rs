use std::time::Duration;

use chirp_core::SessionProfile;

use crate::error::ConnectionError;

/// Platform-abstracted XMPP stream.
///
/// The session manager drives this in two phases: `connect` establishes the
/// stream (TCP dial, STARTTLS, feature negotiation) and `authenticate` runs
/// SASL and resource binding. Everything after that is raw stanza frames.
pub trait XmppTransport: Send + 'static {
    fn connect(
        profile: &SessionProfile,
        io_timeout: Duration,
    ) -> impl Future<Output = Result<Self, ConnectionError>>
    where
        Self: Sized;

    fn authenticate(
        &mut self,
        password: &str,
    ) -> impl Future<Output = Result<(), ConnectionError>>;

    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), ConnectionError>>;

    /// Next complete stanza frame. Blocks until one arrives; the caller is
    /// responsible for wrapping this in its own poll timeout.
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, ConnectionError>>;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>>;
}

#[cfg(feature = "native")]
pub use native::TcpTransport;

#[cfg(feature = "native")]
mod native {
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;
    use tokio_util::codec::Decoder;
    use tokio_xmpp::{
        Packet, XmppCodec,
        connect::{AsyncReadAndWrite, ServerConnector},
        parsers::{jid::Jid, ns},
        starttls::{ServerConfig, error::Error as StartTlsError},
        xmpp_stream::XMPPStream,
    };
    use tracing::debug;

    use super::*;
    use crate::auth;

    const RECV_BUFFER_SIZE: usize = 16 * 1024;
    // The codec wants to see a stream header before stanzas; the real one was
    // consumed during negotiation, so prime it with a synthetic header.
    const STREAM_PRIME: &str =
        "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

    type TlsStream = <ServerConfig as ServerConnector>::Stream;

    /// STARTTLS stream over TCP, dialed through tokio-xmpp.
    pub struct TcpTransport {
        io_timeout: Duration,
        phase: Phase,
    }

    enum Phase {
        /// Stream negotiated, SASL not yet run.
        AwaitingAuth {
            stream: Box<XMPPStream<TlsStream>>,
            username: String,
        },
        /// Authenticated and bound; raw stanza traffic.
        Ready {
            stream: Box<dyn AsyncReadAndWrite>,
            codec: XmppCodec,
            buffer: BytesMut,
        },
        Closed,
    }

    fn parse_jid(jid: &str) -> Result<Jid, ConnectionError> {
        jid.parse::<Jid>().map_err(|error| {
            ConnectionError::TransportError(format!("invalid JID '{jid}': {error}"))
        })
    }

    fn map_starttls_error(error: StartTlsError) -> ConnectionError {
        let message = error.to_string();
        let lower = message.to_ascii_lowercase();
        if lower.contains("dns") || lower.contains("resolve") || lower.contains("srv") {
            ConnectionError::DnsResolutionFailed(message)
        } else if lower.contains("tls") || lower.contains("certificate") || lower.contains("handshake")
        {
            ConnectionError::TlsHandshakeFailed(message)
        } else {
            ConnectionError::TransportError(message)
        }
    }

    fn map_io_error(error: std::io::Error) -> ConnectionError {
        ConnectionError::TransportError(error.to_string())
    }

    fn primed_codec() -> XmppCodec {
        let mut codec = XmppCodec::new();
        let mut bootstrap = BytesMut::from(STREAM_PRIME.as_bytes());
        let _ = codec.decode(&mut bootstrap);
        codec
    }

    fn frame_from_packet(packet: Packet) -> Result<Option<Vec<u8>>, ConnectionError> {
        match packet {
            Packet::Stanza(element) => {
                let mut payload = Vec::new();
                element
                    .write_to(&mut payload)
                    .map_err(|error| ConnectionError::TransportError(error.to_string()))?;
                Ok(Some(payload))
            }
            Packet::Text(_) | Packet::StreamStart(_) => Ok(None),
            Packet::StreamEnd => Err(ConnectionError::TransportError(
                "stream closed by peer".to_string(),
            )),
        }
    }

    impl XmppTransport for TcpTransport {
        async fn connect(
            profile: &SessionProfile,
            io_timeout: Duration,
        ) -> Result<Self, ConnectionError> {
            let jid = parse_jid(&profile.jid)?;
            let username = jid
                .node()
                .map(|node| node.to_string())
                .ok_or_else(|| {
                    ConnectionError::TransportError(format!(
                        "JID '{}' has no local part",
                        profile.jid
                    ))
                })?;

            let server_config = ServerConfig::Manual {
                host: profile.host.clone(),
                port: profile.port,
            };

            let stream = timeout(io_timeout, server_config.connect(&jid, ns::JABBER_CLIENT))
                .await
                .map_err(|_| ConnectionError::Timeout)?
                .map_err(map_starttls_error)?;

            debug!(host = %profile.host, port = profile.port, "XMPP stream established");

            Ok(Self {
                io_timeout,
                phase: Phase::AwaitingAuth {
                    stream: Box::new(stream),
                    username,
                },
            })
        }

        async fn authenticate(&mut self, password: &str) -> Result<(), ConnectionError> {
            match std::mem::replace(&mut self.phase, Phase::Closed) {
                Phase::AwaitingAuth { stream, username } => {
                    let inner = timeout(
                        self.io_timeout,
                        auth::negotiate(*stream, &username, password),
                    )
                    .await
                    .map_err(|_| ConnectionError::Timeout)??;

                    self.phase = Phase::Ready {
                        stream: Box::new(inner),
                        codec: primed_codec(),
                        buffer: BytesMut::with_capacity(RECV_BUFFER_SIZE),
                    };
                    Ok(())
                }
                ready @ Phase::Ready { .. } => {
                    self.phase = ready;
                    Ok(())
                }
                Phase::Closed => Err(ConnectionError::NotConnected),
            }
        }

        async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
            if data.is_empty() {
                return Ok(());
            }
            let Phase::Ready { stream, .. } = &mut self.phase else {
                return Err(ConnectionError::NotConnected);
            };

            timeout(self.io_timeout, stream.write_all(data))
                .await
                .map_err(|_| ConnectionError::Timeout)?
                .map_err(map_io_error)?;
            timeout(self.io_timeout, stream.flush())
                .await
                .map_err(|_| ConnectionError::Timeout)?
                .map_err(map_io_error)?;
            Ok(())
        }

        async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
            let Phase::Ready {
                stream,
                codec,
                buffer,
            } = &mut self.phase
            else {
                return Err(ConnectionError::NotConnected);
            };

            loop {
                if let Some(packet) = codec
                    .decode(buffer)
                    .map_err(|error| ConnectionError::TransportError(error.to_string()))?
                {
                    if let Some(frame) = frame_from_packet(packet)? {
                        return Ok(frame);
                    }
                    continue;
                }

                let mut chunk = vec![0_u8; RECV_BUFFER_SIZE];
                let read = stream.read(&mut chunk).await.map_err(map_io_error)?;
                if read == 0 {
                    return Err(ConnectionError::TransportError(
                        "stream closed by peer".to_string(),
                    ));
                }
                buffer.extend_from_slice(&chunk[..read]);
            }
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            if let Phase::Ready { stream, .. } = &mut self.phase {
                timeout(self.io_timeout, stream.shutdown())
                    .await
                    .map_err(|_| ConnectionError::Timeout)?
                    .map_err(map_io_error)?;
            }
            self.phase = Phase::Closed;
            Ok(())
        }
    }
}
