//! XEP-0184: Message Delivery Receipts.
//!
//! The handler answers receipt requests with `<received/>` elements
//! mirroring the message id, and resolves
//! [`send_message`][`Handler::send_message`] calls when the matching
//! receipt arrives. Like the iq correlator, tracking state is removed by a
//! drop guard when a waiting send is cancelled.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use futures::future::{BoxFuture, FutureExt};
use rxml::Event;
use tokio::sync::oneshot;
use xso::{AsXml, FromXml};

use crate::error::{Error, ProtocolError};
use crate::ns;
use crate::session::{Session, TokenReadWriter};
use crate::stanza::{self, Message, Stanza};
use crate::stream::new_stream_id;
use crate::xmlstream;

/// A request for a delivery receipt.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone, Default)]
#[xml(namespace = ns::RECEIPTS, name = "request")]
pub struct Request;

/// A delivery receipt.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::RECEIPTS, name = "received")]
pub struct Received {
    /// The id of the message being acknowledged.
    #[xml(attribute)]
    pub id: String,
}

/// Tracks sent messages and answers inbound receipt requests.
#[derive(Debug, Default)]
pub struct Handler {
    pending: StdMutex<HashMap<String, oneshot::Sender<()>>>,
}

impl Handler {
    /// Constructs an empty receipt tracker.
    pub fn new() -> Handler {
        Handler::default()
    }

    /// Sends a message with a receipt request and waits for the receipt.
    ///
    /// The message id (generated when absent) keys the receipt. There is
    /// no internal timeout; combine with [`tokio::time::timeout`] as
    /// needed. Cancelling the future stops the tracking.
    pub async fn send_message(&self, session: &Session, mut message: Message) -> Result<(), Error> {
        let id = match message.id.clone() {
            Some(id) => id,
            None => {
                let id = new_stream_id();
                message.id = Some(id.clone());
                id
            }
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.contains_key(&id) {
                return Err(ProtocolError::IqIdInFlight(id).into());
            }
            pending.insert(id.clone(), tx);
        }
        let guard = PendingGuard { handler: self, id };

        let request = Request;
        let payload = request.as_xml_iter().map_err(ProtocolError::Parse)?;
        session
            .send(stanza::wrap_message(session.content_ns(), &message, payload))
            .await?;

        rx.await.map_err(|_| Error::Disconnected)?;
        drop(guard);
        Ok(())
    }

    fn receipt(&self, id: &str) {
        if let Some(waiter) = self.pending.lock().unwrap().remove(id) {
            let _ = waiter.send(());
        }
    }
}

struct PendingGuard<'a> {
    handler: &'a Handler,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.handler.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

impl crate::session::Handler for &Handler {
    fn handle_xmpp<'a>(
        &'a mut self,
        rw: &'a mut TokenReadWriter<'_>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        handle(*self, rw).boxed()
    }
}

impl crate::session::Handler for std::sync::Arc<Handler> {
    fn handle_xmpp<'a>(
        &'a mut self,
        rw: &'a mut TokenReadWriter<'_>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        handle(&**self, rw).boxed()
    }
}

async fn handle(handler: &Handler, rw: &mut TokenReadWriter<'_>) -> Result<(), Error> {
    let Stanza::Message(message) = rw.stanza().clone() else {
        return Ok(());
    };

    // Find the receipts element among the payload children.
    loop {
        match rw.token().await? {
            None => return Ok(()),
            Some(ev @ Event::StartElement(_, _, _)) => {
                let matched = match &ev {
                    Event::StartElement(_, qname, _) if qname.0 == ns::RECEIPTS => {
                        Some(qname.1.to_string())
                    }
                    _ => None,
                };
                match matched.as_deref() {
                    Some("request") => {
                        rw.unget(ev);
                        let _request: Request = read_payload(rw).await?;
                        let Some(id) = message.id.clone() else {
                            // A request on an id-less message cannot be
                            // acknowledged.
                            return Ok(());
                        };
                        let reply = Message {
                            id: None,
                            to: message.from.clone(),
                            from: message.to.clone(),
                            lang: None,
                            type_: message.type_,
                        };
                        let received = Received { id };
                        let payload = received.as_xml_iter().map_err(ProtocolError::Parse)?;
                        let ns = rw.content_ns();
                        rw.send(stanza::wrap_message(ns, &reply, payload)).await?;
                        return Ok(());
                    }
                    Some("received") => {
                        rw.unget(ev);
                        let received: Received = read_payload(rw).await?;
                        handler.receipt(&received.id);
                        return Ok(());
                    }
                    _ => {
                        rw.unget(ev);
                        skip_payload(rw).await?;
                    }
                }
            }
            Some(_) => continue,
        }
    }
}

/// Reads one payload element from the stanza reader.
async fn read_payload<T: FromXml>(rw: &mut TokenReadWriter<'_>) -> Result<T, Error> {
    let (name, attrs) = match rw.token().await?.ok_or_else(xmlstream::eof_error)? {
        Event::StartElement(_, name, attrs) => (name, attrs),
        _ => return Err(ProtocolError::InvalidToken.into()),
    };
    let ctx = xso::Context::empty();
    let mut builder = <Result<T, xso::error::Error> as FromXml>::from_events(name, attrs, &ctx)
        .map_err(|e| match e {
            xso::error::FromEventsError::Mismatch { .. } => {
                ProtocolError::Parse(xso::error::Error::TypeMismatch)
            }
            xso::error::FromEventsError::Invalid(e) => ProtocolError::Parse(e),
        })?;
    loop {
        let ev = rw
            .token()
            .await?
            .ok_or_else(xmlstream::eof_error)?;
        match xso::FromEventsBuilder::feed(&mut builder, ev, &ctx).map_err(ProtocolError::Parse)? {
            Some(Ok(value)) => return Ok(value),
            Some(Err(e)) => return Err(ProtocolError::Parse(e).into()),
            None => (),
        }
    }
}

/// Skips one payload element (start already pushed back).
async fn skip_payload(rw: &mut TokenReadWriter<'_>) -> Result<(), Error> {
    let mut depth = 0usize;
    loop {
        match rw.token().await?.ok_or_else(xmlstream::eof_error)? {
            Event::StartElement(_, _, _) => depth += 1,
            Event::EndElement(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            _ => (),
        }
    }
}
