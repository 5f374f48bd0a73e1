//! The iq correlator.
//!
//! `iq` stanzas of type `get` and `set` demand a `result` or `error` reply
//! carrying the same id. [`Session::send_iq`] registers a one-shot waiter
//! keyed by the id before the request hits the wire; when the serve loop
//! reads a matching response it hands the token stream to that waiter over
//! a bounded channel and does not advance until the element has been fully
//! forwarded. Response bodies are never buffered, and responses to
//! concurrent requesters can never interleave because every waiter gets
//! its own channel.

use rxml::{AttrMap, Event};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, ProtocolError};
use crate::stanza::{self, Iq, Stanza};
use crate::stream::new_stream_id;
use crate::xmlstream::{self, InputStream, ItemResult};

use super::Session;

/// What the serve loop hands to a waiting [`Session::send_iq`] caller.
pub(crate) struct IqHandoff {
    stanza: Stanza,
    start: Event,
    body: mpsc::Receiver<Event>,
}

/// A received iq response.
///
/// The response is a token stream: the first token is the `iq` start
/// element itself, followed by the payload and the closing tag. The serve
/// loop is blocked from reading further stanzas until this stream has been
/// consumed or dropped; dropping it early releases the serve loop, which
/// then discards the remainder of the element.
pub struct IqResponse {
    stanza: Stanza,
    start: Option<Event>,
    body: mpsc::Receiver<Event>,
    depth: usize,
    done: bool,
}

impl IqResponse {
    fn new(handoff: IqHandoff) -> IqResponse {
        IqResponse {
            stanza: handoff.stanza,
            start: Some(handoff.start),
            body: handoff.body,
            depth: 0,
            done: false,
        }
    }

    /// The parsed envelope of the response.
    pub fn stanza(&self) -> &Stanza {
        &self.stanza
    }

    /// Reads the next token of the response element.
    ///
    /// Returns `None` once the element has been fully consumed. Fails
    /// with [`Error::Disconnected`] if the session died before the element
    /// was complete.
    pub async fn token(&mut self) -> Result<Option<Event>, Error> {
        if self.done {
            return Ok(None);
        }
        if let Some(start) = self.start.take() {
            self.depth = 1;
            return Ok(Some(start));
        }
        match self.body.recv().await {
            Some(ev) => {
                match &ev {
                    Event::StartElement(_, _, _) => self.depth += 1,
                    Event::EndElement(_) => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            self.done = true;
                        }
                    }
                    _ => (),
                }
                Ok(Some(ev))
            }
            None => Err(Error::Disconnected),
        }
    }
}

/// Deregisters a pending iq waiter when its `send_iq` call is cancelled.
struct PendingGuard<'a> {
    session: &'a Session,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.session.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

impl Session {
    /// Sends an `iq` stanza.
    ///
    /// For requests (type `get` or `set`) a waiter is registered under the
    /// stanza id (generated when `iq.id` is empty) and the call resolves
    /// to the matching [`IqResponse`] once the serve loop reads it. The
    /// caller must consume (or drop) the response to release the serve
    /// loop. An id equal to one already in flight is refused.
    ///
    /// For responses (type `result` or `error`) the stanza is written and
    /// `None` is returned.
    ///
    /// There is no internal timeout: if the peer never answers, the future
    /// never resolves. Combine it with [`tokio::time::timeout`] as needed;
    /// cancelling the future deregisters the waiter.
    pub async fn send_iq<'x, I>(
        &self,
        mut iq: Iq,
        payload: I,
    ) -> Result<Option<IqResponse>, Error>
    where
        I: Iterator<Item = ItemResult<'x>> + Send,
    {
        if !iq.type_.is_request() {
            self.send(stanza::wrap_iq(
                self.content_ns(),
                &iq,
                xmlstream::reborrow(payload),
            ))
            .await?;
            return Ok(None);
        }

        if iq.id.is_empty() {
            iq.id = new_stream_id();
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.contains_key(&iq.id) {
                return Err(ProtocolError::IqIdInFlight(iq.id).into());
            }
            pending.insert(iq.id.clone(), tx);
        }
        let guard = PendingGuard {
            session: self,
            id: iq.id.clone(),
        };

        self.send(stanza::wrap_iq(
            self.content_ns(),
            &iq,
            xmlstream::reborrow(payload),
        ))
        .await?;

        let handoff = rx.await.map_err(|_| Error::Disconnected)?;
        drop(guard);
        Ok(Some(IqResponse::new(handoff)))
    }

    /// Serve-loop side of the correlator: forward the current element to
    /// the waiter, token by token, without buffering it.
    pub(crate) async fn handoff(
        &self,
        input: &mut InputStream,
        stanza: Stanza,
        extra_attrs: AttrMap,
        waiter: oneshot::Sender<IqHandoff>,
    ) -> Result<(), Error> {
        let start = stanza.rebuild_start(extra_attrs, self.content_ns());
        let (tx, body) = mpsc::channel(1);
        if waiter
            .send(IqHandoff {
                stanza,
                start,
                body,
            })
            .is_err()
        {
            // The waiter was cancelled after we took it out of the table.
            return xmlstream::skip_element(input).await;
        }

        let mut depth = 0usize;
        loop {
            let ev = input
                .next_event()
                .await?
                .ok_or_else(xmlstream::eof_error)?;
            let last = match &ev {
                Event::StartElement(_, _, _) => {
                    depth += 1;
                    false
                }
                Event::EndElement(_) => {
                    if depth == 0 {
                        true
                    } else {
                        depth -= 1;
                        false
                    }
                }
                _ => false,
            };
            if tx.send(ev).await.is_err() {
                // The waiter dropped the response mid-element; discard the
                // rest ourselves.
                if last {
                    return Ok(());
                }
                return skip_remaining(input, depth).await;
            }
            if last {
                return Ok(());
            }
        }
    }
}

async fn skip_remaining(input: &mut InputStream, mut depth: usize) -> Result<(), Error> {
    loop {
        match input
            .next_event()
            .await?
            .ok_or_else(xmlstream::eof_error)?
        {
            Event::StartElement(_, _, _) => depth += 1,
            Event::EndElement(_) => {
                if depth == 0 {
                    return Ok(());
                }
                depth -= 1;
            }
            _ => (),
        }
    }
}
