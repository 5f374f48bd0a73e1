//! The STARTTLS stream feature (RFC 6120 §5).
//!
//! TLS itself is external: the feature is handed a [`TlsConnector`] or
//! [`TlsAcceptor`] and only drives the in-band upgrade dance. On success
//! it returns a transport upgrade, which forces a stream restart.

use std::io;

use futures::future::{BoxFuture, FutureExt};
use rxml::Event;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use xso::{AsXml, FromXml};

use crate::error::{Error, ProtocolError};
use crate::negotiate::{
    FeatureData, FeatureName, Negotiated, NegotiateStream, Restart, StreamFeature,
};
use crate::ns;
use crate::session::SessionState;
use crate::stream::error::DefinedCondition;
use crate::xmlstream::{eof_error, Transport};

/// The feature advertisement, `<starttls/>` inside `<stream:features/>`.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::TLS, name = "starttls")]
pub struct Offer {
    /// Marker for mandatory TLS.
    #[xml(child(default))]
    pub required: Option<Required>,
}

/// Marker for mandatory TLS.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::TLS, name = "required")]
pub struct Required;

/// The initiator's request to start TLS.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::TLS, name = "starttls")]
pub struct Request;

/// Information that TLS may now commence.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::TLS, name = "proceed")]
pub struct Proceed;

/// The responder's refusal; the stream ends without an error.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::TLS, name = "failure")]
pub struct Failure;

/// The STARTTLS stream feature.
pub struct StartTls {
    required: bool,
    connector: Option<TlsConnector>,
    acceptor: Option<TlsAcceptor>,
}

impl StartTls {
    /// STARTTLS for the initiator side of a stream.
    pub fn client(required: bool, connector: TlsConnector) -> StartTls {
        StartTls {
            required,
            connector: Some(connector),
            acceptor: None,
        }
    }

    /// STARTTLS for the responder side of a stream.
    pub fn server(required: bool, acceptor: TlsAcceptor) -> StartTls {
        StartTls {
            required,
            connector: None,
            acceptor: Some(acceptor),
        }
    }
}

impl StreamFeature for StartTls {
    fn name(&self) -> FeatureName {
        FeatureName {
            ns: ns::TLS,
            local: "starttls",
        }
    }

    fn prohibited(&self) -> SessionState {
        SessionState::SECURE
    }

    fn list<'a>(&'a self, stream: &'a mut NegotiateStream) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            let offer = Offer {
                required: self.required.then_some(Required),
            };
            stream.send_xso(&offer).await?;
            Ok(self.required)
        }
        .boxed()
    }

    fn parse<'a>(
        &'a self,
        stream: &'a mut NegotiateStream,
    ) -> BoxFuture<'a, Result<(bool, Option<FeatureData>), Error>> {
        async move {
            let offer: Offer = stream.read_xso().await?;
            Ok((offer.required.is_some(), None))
        }
        .boxed()
    }

    fn negotiate<'a>(
        &'a self,
        stream: &'a mut NegotiateStream,
        _data: Option<FeatureData>,
    ) -> BoxFuture<'a, Result<Negotiated, Error>> {
        async move {
            if stream.state().contains(SessionState::RECEIVED) {
                let _request: Request = stream.read_xso().await?;
                let Some(acceptor) = self.acceptor.clone() else {
                    return Err(ProtocolError::TlsNotConfigured.into());
                };
                stream.send_xso(&Proceed).await?;
                let upgrade = Box::new(move |transport: Transport| {
                    async move {
                        let tls = acceptor.accept(transport).await?;
                        Ok(Box::new(tls) as Transport)
                    }
                    .boxed()
                });
                Ok(Negotiated {
                    mask: SessionState::SECURE,
                    restart: Restart::Upgrade(upgrade),
                    end_stream: false,
                })
            } else {
                stream.send_xso(&Request).await?;

                let ev = stream.next_event().await?.ok_or_else(eof_error)?;
                let local = match &ev {
                    Event::StartElement(_, qname, _) if qname.0 == ns::TLS => {
                        qname.1.to_string()
                    }
                    Event::StartElement(_, _, _) => {
                        let e = Error::SentStream(
                            DefinedCondition::UnsupportedStanzaType.into(),
                        );
                        return Err(stream.fail(e).await);
                    }
                    _ => {
                        let e = Error::SentStream(DefinedCondition::RestrictedXml.into());
                        return Err(stream.fail(e).await);
                    }
                };

                match local.as_str() {
                    "proceed" => {
                        stream.skip_element().await?;

                        let Some(connector) = self.connector.clone() else {
                            return Err(ProtocolError::TlsNotConfigured.into());
                        };
                        let domain = stream.remote().domainpart().to_owned();
                        let server_name = ServerName::try_from(domain).map_err(|e| {
                            Error::Io(io::Error::new(io::ErrorKind::InvalidInput, e))
                        })?;
                        let upgrade = Box::new(move |transport: Transport| {
                            async move {
                                let tls = connector.connect(server_name, transport).await?;
                                Ok(Box::new(tls) as Transport)
                            }
                            .boxed()
                        });
                        Ok(Negotiated {
                            mask: SessionState::SECURE,
                            restart: Restart::Upgrade(upgrade),
                            end_stream: false,
                        })
                    }
                    "failure" => {
                        // Not an error: the peer is telling us to end the
                        // stream.
                        stream.skip_element().await?;
                        Ok(Negotiated {
                            mask: SessionState::EMPTY,
                            restart: Restart::No,
                            end_stream: true,
                        })
                    }
                    _ => {
                        let e = Error::SentStream(
                            DefinedCondition::UnsupportedStanzaType.into(),
                        );
                        Err(stream.fail(e).await)
                    }
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use tokio::io::AsyncWriteExt;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    use crate::jid::Jid;

    fn connector() -> TlsConnector {
        let config = ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    fn client_stream(io: tokio::io::DuplexStream) -> NegotiateStream {
        let local: Jid = "mercutio@example.net".parse().unwrap();
        let remote: Jid = "example.net".parse().unwrap();
        NegotiateStream::new(
            Box::new(io),
            SessionState::EMPTY,
            local,
            remote,
            ns::CLIENT,
            None,
        )
    }

    #[tokio::test]
    async fn failure_ends_the_stream_without_error() {
        let (lhs, mut rhs) = tokio::io::duplex(4096);
        let mut stream = client_stream(lhs);

        rhs.write_all(
            br#"<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"#,
        )
        .await
        .unwrap();

        let feature = StartTls::client(true, connector());
        let outcome = feature.negotiate(&mut stream, None).await.unwrap();
        assert!(outcome.end_stream);
        assert!(outcome.mask.is_empty());
    }

    #[tokio::test]
    async fn offer_parse_reads_required_marker() {
        let (lhs, mut rhs) = tokio::io::duplex(4096);
        let mut stream = client_stream(lhs);

        rhs.write_all(
            [
                br#"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'>"#.as_slice(),
                br#"<required/></starttls>"#.as_slice(),
            ]
            .concat()
            .as_slice(),
        )
        .await
        .unwrap();

        let feature = StartTls::client(false, connector());
        let (required, data) = feature.parse(&mut stream).await.unwrap();
        assert!(required);
        assert!(data.is_none());
    }
}
