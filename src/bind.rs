//! The resource binding stream feature (RFC 6120 §7).
//!
//! Binding is the final negotiation step of a client stream: the client
//! may request a resource, the server assigns one (the requested one or a
//! generated one), and the resulting full JID becomes the session's local
//! address. Completing it marks the session ready.

use futures::future::{BoxFuture, FutureExt};
use rxml::{Event, Namespace};
use xso::{AsXml, FromXml};

use crate::error::{Error, ProtocolError};
use crate::jid::Jid;
use crate::negotiate::{
    FeatureData, FeatureName, Negotiated, NegotiateStream, Restart, StreamFeature,
};
use crate::ns;
use crate::session::SessionState;
use crate::stanza::{self, Iq, IqType};
use crate::stream::error::DefinedCondition;
use crate::stream::new_stream_id;
use crate::xmlstream::eof_error;

/// The `<bind/>` element: the feature advertisement, the request payload
/// and the response payload all share this shape.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone, Default)]
#[xml(namespace = ns::BIND, name = "bind")]
pub struct Bind {
    /// The resource the client requests.
    #[xml(child(default))]
    pub resource: Option<Resource>,

    /// The full JID the server assigned.
    #[xml(child(default))]
    pub jid: Option<BoundJid>,
}

/// A requested resourcepart.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::BIND, name = "resource")]
pub struct Resource {
    /// The resourcepart.
    #[xml(text)]
    pub value: String,
}

/// The server-assigned full JID.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::BIND, name = "jid")]
pub struct BoundJid {
    /// The full JID.
    #[xml(text)]
    pub value: Jid,
}

/// The resource binding stream feature.
#[derive(Debug, Default)]
pub struct BindResource;

impl BindResource {
    /// Constructs the feature.
    pub fn new() -> BindResource {
        BindResource
    }
}

impl StreamFeature for BindResource {
    fn name(&self) -> FeatureName {
        FeatureName {
            ns: ns::BIND,
            local: "bind",
        }
    }

    fn necessary(&self) -> SessionState {
        SessionState::AUTHN
    }

    fn prohibited(&self) -> SessionState {
        SessionState::READY
    }

    fn list<'a>(&'a self, stream: &'a mut NegotiateStream) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            stream.send_xso(&Bind::default()).await?;
            Ok(true)
        }
        .boxed()
    }

    fn parse<'a>(
        &'a self,
        stream: &'a mut NegotiateStream,
    ) -> BoxFuture<'a, Result<(bool, Option<FeatureData>), Error>> {
        async move {
            let _offer: Bind = stream.read_xso().await?;
            Ok((true, None))
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
                negotiate_server(stream).await
            } else {
                negotiate_client(stream).await
            }
        }
        .boxed()
    }
}

async fn negotiate_client(stream: &mut NegotiateStream) -> Result<Negotiated, Error> {
    let id = new_stream_id();
    let request = Bind {
        resource: stream
            .local()
            .resourcepart()
            .map(|value| Resource {
                value: value.to_owned(),
            }),
        jid: None,
    };
    let iq = Iq::new(IqType::Set, id.as_str());
    let payload = request.as_xml_iter().map_err(ProtocolError::Parse)?;
    stream
        .send_items(stanza::wrap_iq(stream.content_ns(), &iq, payload))
        .await?;

    // The reply: <iq type='result' id='…'><bind><jid>…</jid></bind></iq>
    let (name, mut attrs) = match stream.next_event().await?.ok_or_else(eof_error)? {
        Event::StartElement(_, name, attrs) => (name, attrs),
        _ => {
            let e = Error::SentStream(DefinedCondition::RestrictedXml.into());
            return Err(stream.fail(e).await);
        }
    };
    if name.0 != stream.content_ns() || name.1 != "iq" {
        return Err(ProtocolError::InvalidBindResponse.into());
    }
    let type_ = attrs.remove(Namespace::none(), "type").unwrap_or_default();
    let reply_id = attrs.remove(Namespace::none(), "id").unwrap_or_default();
    if type_ != "result" || reply_id != id {
        return Err(ProtocolError::InvalidBindResponse.into());
    }

    let response: Bind = stream.read_xso().await?;
    let Some(bound) = response.jid else {
        return Err(ProtocolError::InvalidBindResponse.into());
    };

    // Consume the iq's closing tag.
    match stream.next_event().await?.ok_or_else(eof_error)? {
        Event::EndElement(_) => (),
        _ => return Err(ProtocolError::InvalidBindResponse.into()),
    }

    log::debug!("bound to {}", bound.value);
    stream.set_local(bound.value);
    Ok(Negotiated {
        mask: SessionState::READY,
        restart: Restart::No,
        end_stream: false,
    })
}

async fn negotiate_server(stream: &mut NegotiateStream) -> Result<Negotiated, Error> {
    // The client's <iq type='set'> selection element is next on the stream.
    let (name, mut attrs) = match stream.next_event().await?.ok_or_else(eof_error)? {
        Event::StartElement(_, name, attrs) => (name, attrs),
        _ => {
            let e = Error::SentStream(DefinedCondition::RestrictedXml.into());
            return Err(stream.fail(e).await);
        }
    };
    if name.0 != stream.content_ns()
        || name.1 != "iq"
        || attrs.remove(Namespace::none(), "type").as_deref() != Some("set")
    {
        let e = Error::SentStream(DefinedCondition::BadFormat.into());
        return Err(stream.fail(e).await);
    }
    let Some(id) = attrs.remove(Namespace::none(), "id") else {
        let e = Error::SentStream(DefinedCondition::BadFormat.into());
        return Err(stream.fail(e).await);
    };

    let request: Bind = stream.read_xso().await?;
    match stream.next_event().await?.ok_or_else(eof_error)? {
        Event::EndElement(_) => (),
        _ => {
            let e = Error::SentStream(DefinedCondition::BadFormat.into());
            return Err(stream.fail(e).await);
        }
    }

    let resource = match request.resource {
        Some(resource) => resource.value,
        None => new_stream_id(),
    };
    let full = stream.remote().bare().with_resource(&resource)?;
    stream.set_remote(full.clone());

    let response = Bind {
        resource: None,
        jid: Some(BoundJid { value: full }),
    };
    let reply = Iq::new(IqType::Result, id.as_str());
    let payload = response.as_xml_iter().map_err(ProtocolError::Parse)?;
    stream
        .send_items(stanza::wrap_iq(stream.content_ns(), &reply, payload))
        .await?;

    Ok(Negotiated {
        mask: SessionState::READY,
        restart: Restart::No,
        end_stream: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn client_adopts_the_assigned_jid() {
        let (lhs, mut rhs) = tokio::io::duplex(8192);
        let local: Jid = "mercutio@example.net".parse().unwrap();
        let remote: Jid = "example.net".parse().unwrap();
        let mut stream = NegotiateStream::new(
            Box::new(lhs),
            SessionState::AUTHN,
            local,
            remote,
            ns::CLIENT,
            None,
        );

        let feature = BindResource::new();
        let peer = tokio::spawn(async move {
            // Answer with a server-assigned full JID. The request id is
            // not known in advance, so read the request first.
            let mut buf = vec![0u8; 4096];
            let mut read = 0usize;
            let id = loop {
                let n = tokio::io::AsyncReadExt::read(&mut rhs, &mut buf[read..])
                    .await
                    .unwrap();
                assert_ne!(n, 0, "request never completed");
                read += n;
                let text = String::from_utf8_lossy(&buf[..read]).into_owned();
                if let Some(rest) = text.split("id=\"").nth(1) {
                    if let Some(end) = rest.find('"') {
                        if text.contains("</iq>") {
                            break rest[..end].to_owned();
                        }
                    }
                }
            };
            let reply = format!(
                "<iq xmlns='jabber:client' type='result' id='{}'>\
                 <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                 <jid>mercutio@example.net/balcony</jid></bind></iq>",
                id
            );
            rhs.write_all(reply.as_bytes()).await.unwrap();
            rhs
        });

        let outcome = feature.negotiate(&mut stream, None).await.unwrap();
        assert!(outcome.mask.contains(SessionState::READY));
        assert_eq!(
            stream.local().to_string(),
            "mercutio@example.net/balcony"
        );
        peer.await.unwrap();
    }
}
