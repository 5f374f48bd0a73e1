//! XEP-0199: XMPP Ping.

use futures::future::{BoxFuture, FutureExt};
use xso::{AsXml, FromXml};

use crate::error::{Error, ProtocolError};
use crate::jid::Jid;
use crate::ns;
use crate::session::{Session, TokenReadWriter};
use crate::stanza::{self, Iq, IqType, Stanza};
use crate::xmlstream::empty;

/// The `<ping/>` payload.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone, Default)]
#[xml(namespace = ns::PING, name = "ping")]
pub struct Ping;

/// Sends a ping iq and waits for the pong.
///
/// An error-typed reply (the peer does not implement ping, or refused it)
/// is surfaced as an error; anything that answers proves the stream is
/// alive either way.
pub async fn send(session: &Session, to: Option<Jid>) -> Result<(), Error> {
    let mut iq = Iq::new(IqType::Get, "");
    iq.to = to;
    let ping = Ping;
    let payload = ping.as_xml_iter().map_err(ProtocolError::Parse)?;
    let response = session.send_iq(iq, payload).await?;

    let Some(mut response) = response else {
        return Ok(());
    };
    let failed = matches!(response.stanza(), Stanza::Iq(iq) if iq.type_ == IqType::Error);
    while response.token().await?.is_some() {}
    if failed {
        return Err(ProtocolError::Parse(xso::error::Error::Other("ping failed")).into());
    }
    Ok(())
}

/// A [`Handler`][`crate::Handler`] answering pings with empty results.
///
/// Register it on a [`ServeMux`][`crate::ServeMux`] for `get` iqs with a
/// `{urn:xmpp:ping}ping` payload.
#[derive(Debug, Default)]
pub struct Handler;

impl crate::session::Handler for Handler {
    fn handle_xmpp<'a>(
        &'a mut self,
        rw: &'a mut TokenReadWriter<'_>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let Stanza::Iq(iq) = rw.stanza().clone() else {
                return Ok(());
            };
            if iq.type_ != IqType::Get {
                return Ok(());
            }
            let reply = Iq {
                id: iq.id,
                to: iq.from,
                from: iq.to,
                lang: None,
                type_: IqType::Result,
            };
            rw.send(stanza::wrap_iq(rw.content_ns(), &reply, empty()))
                .await
        }
        .boxed()
    }
}
