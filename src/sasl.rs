//! The SASL stream feature (RFC 6120 §6).
//!
//! The cryptographic mechanisms themselves come from the `sasl` crate;
//! this module drives the challenge/response exchange over the stream.
//! Mechanisms are tried in the configured order, so stronger mechanisms
//! should be listed first. On success the stream restarts on the same
//! transport.

use core::fmt;
use std::borrow::Cow;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as Base64Engine;
use base64::Engine;
use futures::future::{BoxFuture, FutureExt};
use rxml::{xml_ncname, Event, Namespace};
use sasl::client::mechanisms::{Anonymous, Plain, Scram};
use sasl::client::Mechanism as ClientMechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::Credentials;
use sasl::server::Mechanism as ServerMechanism;
use xso::{text::Base64, AsXml, FromXml, Item};

use crate::error::{AuthError, Error};
use crate::negotiate::{
    FeatureData, FeatureName, Negotiated, NegotiateStream, Restart, StreamFeature,
};
use crate::ns;
use crate::session::SessionState;
use crate::stream::error::DefinedCondition as StreamCondition;
use crate::xmlstream::{eof_error, wrap, Head};

/// The feature advertisement: the list of available mechanisms.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone, Default)]
#[xml(namespace = ns::SASL, name = "mechanisms")]
pub struct Mechanisms {
    /// The mechanisms on offer.
    #[xml(child(n = ..))]
    pub mechanisms: Vec<Mechanism>,
}

/// One offered mechanism name.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::SASL, name = "mechanism")]
pub struct Mechanism {
    /// The mechanism name, eg. `SCRAM-SHA-256`.
    #[xml(text)]
    pub name: String,
}

/// A server challenge.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::SASL, name = "challenge")]
pub struct Challenge {
    /// The challenge data.
    #[xml(text = Base64)]
    pub data: Vec<u8>,
}

/// The client's response to a challenge.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::SASL, name = "response")]
pub struct Response {
    /// The response data.
    #[xml(text = Base64)]
    pub data: Vec<u8>,
}

/// Sent by the server on success.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::SASL, name = "success")]
pub struct Success {
    /// Additional data sent with the success.
    #[xml(text = Base64)]
    pub data: Vec<u8>,
}

/// The SASL failure conditions of RFC 6120 §6.5.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::SASL)]
pub enum DefinedCondition {
    /// The client aborted the exchange.
    #[xml(name = "aborted")]
    Aborted,

    /// The account is disabled.
    #[xml(name = "account-disabled")]
    AccountDisabled,

    /// The credentials have expired.
    #[xml(name = "credentials-expired")]
    CredentialsExpired,

    /// Encryption is required before this mechanism may be used.
    #[xml(name = "encryption-required")]
    EncryptionRequired,

    /// The base64 data could not be decoded.
    #[xml(name = "incorrect-encoding")]
    IncorrectEncoding,

    /// The authorization identity was invalid.
    #[xml(name = "invalid-authzid")]
    InvalidAuthzid,

    /// The requested mechanism is invalid or unsupported.
    #[xml(name = "invalid-mechanism")]
    InvalidMechanism,

    /// The request was malformed.
    #[xml(name = "malformed-request")]
    MalformedRequest,

    /// The selected mechanism is weaker than the server allows.
    #[xml(name = "mechanism-too-weak")]
    MechanismTooWeak,

    /// The credentials provided were invalid.
    #[xml(name = "not-authorized")]
    NotAuthorized,

    /// A temporary server-side failure; the client may retry.
    #[xml(name = "temporary-auth-failure")]
    TemporaryAuthFailure,
}

impl fmt::Display for DefinedCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Aborted => "aborted",
            Self::AccountDisabled => "account-disabled",
            Self::CredentialsExpired => "credentials-expired",
            Self::EncryptionRequired => "encryption-required",
            Self::IncorrectEncoding => "incorrect-encoding",
            Self::InvalidAuthzid => "invalid-authzid",
            Self::InvalidMechanism => "invalid-mechanism",
            Self::MalformedRequest => "malformed-request",
            Self::MechanismTooWeak => "mechanism-too-weak",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
        };
        f.write_str(s)
    }
}

/// Sent by the server on failure.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::SASL, name = "failure")]
pub struct Failure {
    /// The failure condition.
    #[xml(child)]
    pub condition: DefinedCondition,

    /// Optional descriptive text.
    #[xml(child(default))]
    pub text: Option<Text>,
}

/// Optional descriptive text inside a failure.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::SASL, name = "text")]
pub struct Text {
    /// The language of the text.
    #[xml(attribute(name = "xml:lang", default))]
    pub lang: Option<String>,

    /// The text itself.
    #[xml(text)]
    pub text: String,
}

type ClientFactory =
    Box<dyn Fn() -> Result<Box<dyn ClientMechanism + Send + Sync>, AuthError> + Send + Sync>;
type ServerFactory = Box<dyn Fn() -> Box<dyn ServerMechanism + Send + Sync> + Send + Sync>;

/// The SASL stream feature.
///
/// Only advertised (and selected) once the stream is secure and not yet
/// authenticated.
pub struct Sasl {
    client: Vec<ClientFactory>,
    server: Vec<(String, ServerFactory)>,
}

impl Sasl {
    /// The client side with the default mechanism ladder: SCRAM-SHA-256,
    /// SCRAM-SHA-1, PLAIN, then ANONYMOUS.
    pub fn client(credentials: Credentials) -> Sasl {
        let scram256 = credentials.clone();
        let scram1 = credentials.clone();
        let plain = credentials;
        Sasl {
            client: vec![
                Box::new(move || {
                    Ok(Box::new(
                        Scram::<Sha256>::from_credentials(scram256.clone())
                            .map_err(AuthError::Sasl)?,
                    ))
                }),
                Box::new(move || {
                    Ok(Box::new(
                        Scram::<Sha1>::from_credentials(scram1.clone())
                            .map_err(AuthError::Sasl)?,
                    ))
                }),
                Box::new(move || {
                    Ok(Box::new(
                        Plain::from_credentials(plain.clone()).map_err(AuthError::Sasl)?,
                    ))
                }),
                Box::new(|| Ok(Box::new(Anonymous::new()))),
            ],
            server: Vec::new(),
        }
    }

    /// A server side offering only ANONYMOUS, which needs no account
    /// storage.
    pub fn server_anonymous() -> Sasl {
        Sasl::server(vec![Box::new(|| {
            Box::new(sasl::server::mechanisms::Anonymous::new())
        })])
    }

    /// A server side driving the given mechanism factories.
    pub fn server(factories: Vec<ServerFactory>) -> Sasl {
        let server = factories
            .into_iter()
            .map(|factory| {
                let name = factory().name().to_owned();
                (name, factory)
            })
            .collect();
        Sasl {
            client: Vec::new(),
            server,
        }
    }
}

/// RFC 6120 §6.4.2: a zero-length initial response is transmitted as a
/// single `=`.
fn encode_initial(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_owned()
    } else {
        Base64Engine.encode(data)
    }
}

fn decode_payload(text: &str) -> Result<Vec<u8>, AuthError> {
    match text {
        "" | "=" => Ok(Vec::new()),
        text => Base64Engine
            .decode(text)
            .map_err(|_| AuthError::Fail(DefinedCondition::IncorrectEncoding)),
    }
}

impl StreamFeature for Sasl {
    fn name(&self) -> FeatureName {
        FeatureName {
            ns: ns::SASL,
            local: "mechanisms",
        }
    }

    fn necessary(&self) -> SessionState {
        SessionState::SECURE
    }

    fn prohibited(&self) -> SessionState {
        SessionState::AUTHN
    }

    fn list<'a>(&'a self, stream: &'a mut NegotiateStream) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            let offer = Mechanisms {
                mechanisms: self
                    .server
                    .iter()
                    .map(|(name, _)| Mechanism { name: name.clone() })
                    .collect(),
            };
            stream.send_xso(&offer).await?;
            Ok(true)
        }
        .boxed()
    }

    fn parse<'a>(
        &'a self,
        stream: &'a mut NegotiateStream,
    ) -> BoxFuture<'a, Result<(bool, Option<FeatureData>), Error>> {
        async move {
            let offer: Mechanisms = stream.read_xso().await?;
            let names: Vec<String> = offer
                .mechanisms
                .into_iter()
                .map(|mechanism| mechanism.name)
                .collect();
            Ok((true, Some(Arc::new(names) as FeatureData)))
        }
        .boxed()
    }

    fn negotiate<'a>(
        &'a self,
        stream: &'a mut NegotiateStream,
        data: Option<FeatureData>,
    ) -> BoxFuture<'a, Result<Negotiated, Error>> {
        async move {
            if stream.state().contains(SessionState::RECEIVED) {
                self.negotiate_server(stream).await
            } else {
                self.negotiate_client(stream, data).await
            }
        }
        .boxed()
    }
}

impl Sasl {
    async fn negotiate_client(
        &self,
        stream: &mut NegotiateStream,
        data: Option<FeatureData>,
    ) -> Result<Negotiated, Error> {
        let offered: Vec<String> = data
            .as_ref()
            .and_then(|data| data.downcast_ref::<Vec<String>>())
            .cloned()
            .unwrap_or_default();

        // Select the strongest mechanism in our preferred order that the
        // peer also offers.
        let mut selected = None;
        for factory in &self.client {
            let mechanism = factory()?;
            if offered.iter().any(|name| name == mechanism.name()) {
                selected = Some(mechanism);
                break;
            }
        }
        let Some(mut mechanism) = selected else {
            return Err(AuthError::NoMechanism.into());
        };
        log::debug!("authenticating with SASL mechanism {}", mechanism.name());

        let initial = mechanism.initial();
        let auth = Head::new(ns::SASL, xml_ncname!("auth"))
            .attr(xml_ncname!("mechanism"), mechanism.name().to_owned());
        let body = core::iter::once(Ok(Item::Text(Cow::Owned(encode_initial(&initial)))));
        stream.send_items(wrap(auth, body)).await?;

        loop {
            let ev = stream.next_event().await?.ok_or_else(eof_error)?;
            let local = match &ev {
                Event::StartElement(_, qname, _) if qname.0 == ns::SASL => qname.1.to_string(),
                Event::StartElement(_, _, _) => {
                    let e = Error::SentStream(StreamCondition::UnsupportedStanzaType.into());
                    return Err(stream.fail(e).await);
                }
                _ => {
                    let e = Error::SentStream(StreamCondition::RestrictedXml.into());
                    return Err(stream.fail(e).await);
                }
            };
            stream.unget(ev);

            match local.as_str() {
                "challenge" => {
                    let challenge: Challenge = stream.read_xso().await?;
                    let response = mechanism
                        .response(&challenge.data)
                        .map_err(AuthError::Sasl)?;
                    stream.send_xso(&Response { data: response }).await?;
                }
                "success" => {
                    // Success data is ignored; no SASL security layer is
                    // installed, TLS is the supported channel.
                    let _success: Success = stream.read_xso().await?;
                    return Ok(Negotiated {
                        mask: SessionState::AUTHN,
                        restart: Restart::SameTransport,
                        end_stream: false,
                    });
                }
                "failure" => {
                    let failure: Failure = stream.read_xso().await?;
                    return Err(AuthError::Fail(failure.condition).into());
                }
                _ => {
                    let e = Error::SentStream(StreamCondition::UnsupportedStanzaType.into());
                    return Err(stream.fail(e).await);
                }
            }
        }
    }

    async fn negotiate_server(&self, stream: &mut NegotiateStream) -> Result<Negotiated, Error> {
        // The client's <auth/> selection element is next on the stream. It
        // is decoded by hand because of the `=` empty-response rule.
        let (mechanism_name, payload) = read_auth(stream).await?;

        let Some((_, factory)) = self
            .server
            .iter()
            .find(|(name, _)| *name == mechanism_name)
        else {
            stream
                .send_xso(&Failure {
                    condition: DefinedCondition::InvalidMechanism,
                    text: None,
                })
                .await?;
            return Err(AuthError::NoMechanism.into());
        };
        let mut mechanism = factory();

        let mut payload = payload;
        loop {
            match mechanism.respond(&payload) {
                Ok(sasl::server::Response::Success(identity, data)) => {
                    log::debug!("SASL success for {:?}", identity);
                    stream.send_xso(&Success { data }).await?;
                    return Ok(Negotiated {
                        mask: SessionState::AUTHN,
                        restart: Restart::SameTransport,
                        end_stream: false,
                    });
                }
                Ok(sasl::server::Response::Proceed(data)) => {
                    stream.send_xso(&Challenge { data }).await?;
                    let response: Response = stream.read_xso().await?;
                    payload = response.data;
                }
                Err(e) => {
                    stream
                        .send_xso(&Failure {
                            condition: DefinedCondition::NotAuthorized,
                            text: None,
                        })
                        .await?;
                    return Err(AuthError::ServerSasl(e).into());
                }
            }
        }
    }
}

/// Reads the client's `<auth mechanism='…'>…</auth>` element.
async fn read_auth(stream: &mut NegotiateStream) -> Result<(String, Vec<u8>), Error> {
    let (name, mut attrs) = match stream.next_event().await?.ok_or_else(eof_error)? {
        Event::StartElement(_, name, attrs) => (name, attrs),
        _ => {
            let e = Error::SentStream(StreamCondition::RestrictedXml.into());
            return Err(stream.fail(e).await);
        }
    };
    if name.0 != ns::SASL || name.1 != "auth" {
        let e = Error::SentStream(StreamCondition::UnsupportedStanzaType.into());
        return Err(stream.fail(e).await);
    }
    let Some(mechanism) = attrs.remove(Namespace::none(), "mechanism") else {
        stream
            .send_xso(&Failure {
                condition: DefinedCondition::MalformedRequest,
                text: None,
            })
            .await?;
        return Err(AuthError::NoMechanism.into());
    };

    let mut text = String::new();
    loop {
        match stream.next_event().await?.ok_or_else(eof_error)? {
            Event::Text(_, chunk) => text.push_str(&chunk),
            Event::EndElement(_) => break,
            Event::StartElement(_, _, _) => {
                let e = Error::SentStream(StreamCondition::RestrictedXml.into());
                return Err(stream.fail(e).await);
            }
            Event::XmlDeclaration(_, _) => (),
        }
    }

    match decode_payload(text.trim()) {
        Ok(payload) => Ok((mechanism, payload)),
        Err(e) => {
            stream
                .send_xso(&Failure {
                    condition: DefinedCondition::IncorrectEncoding,
                    text: None,
                })
                .await?;
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_response_encoding() {
        assert_eq!(encode_initial(b""), "=");
        assert_eq!(encode_initial(b"\0user\0pass"), "AHVzZXIAcGFzcw==");
    }

    #[test]
    fn payload_decoding() {
        assert_eq!(decode_payload("").unwrap(), b"");
        assert_eq!(decode_payload("=").unwrap(), b"");
        assert_eq!(decode_payload("AHVzZXIAcGFzcw==").unwrap(), b"\0user\0pass");
        assert!(decode_payload("!!!").is_err());
    }

    #[test]
    fn client_prefers_stronger_mechanisms() {
        let credentials = Credentials::default()
            .with_username("mercutio")
            .with_password("verona");
        let sasl = Sasl::client(credentials);
        let names: Vec<String> = sasl
            .client
            .iter()
            .filter_map(|factory| factory().ok())
            .map(|mechanism| mechanism.name().to_owned())
            .collect();
        assert_eq!(
            names,
            vec!["SCRAM-SHA-256", "SCRAM-SHA-1", "PLAIN", "ANONYMOUS"]
        );
    }
}
