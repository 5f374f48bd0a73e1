//! XMPP sessions.
//!
//! A [`Session`] is bound to one byte transport and one peer. It owns two
//! half-duplex XML token halves sharing the transport, each behind its own
//! mutex: one task may be reading stanzas in [`serve`][`Session::serve`]
//! while others send concurrently. Inbound dispatch is strictly
//! sequential; one stanza is fully handled before the next token is read.

mod iq;
pub mod state;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;

use futures::future::BoxFuture;
use rxml::{AttrMap, Event};
use tokio::sync::{oneshot, Mutex};
use xso::Item;

use crate::error::{Error, ProtocolError};
use crate::jid::Jid;
use crate::negotiate::{self, FeatureData, NegotiateStream, StreamFeature};
use crate::ns;
use crate::stanza::error::StanzaError;
use crate::stanza::{self, IqType, Stanza};
use crate::stream::error::{DefinedCondition, StreamError};
use crate::stream::StreamInfo;
use crate::xmlstream::{
    self, eof_error, AsyncReadAndWrite, InputStream, ItemResult, OutputStream,
};

pub use self::iq::IqResponse;
pub use self::state::SessionState;

use self::iq::IqHandoff;

/// The class of the peer on the other end of a stream, which selects the
/// stream content namespace and the connection defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// A client-to-server stream (`jabber:client`).
    Client,
    /// A server-to-server stream (`jabber:server`).
    Server,
}

impl Peer {
    /// The default namespace of streams of this class.
    pub fn content_ns(self) -> &'static str {
        match self {
            Peer::Client => ns::CLIENT,
            Peer::Server => ns::SERVER,
        }
    }

    /// The DNS SRV service label used to locate peers of this class.
    pub fn srv_service(self) -> &'static str {
        match self {
            Peer::Client => "xmpp-client",
            Peer::Server => "xmpp-server",
        }
    }

    /// The port used when SRV resolution yields nothing.
    pub fn default_port(self) -> u16 {
        match self {
            Peer::Client => 5222,
            Peer::Server => 5269,
        }
    }
}

/// Configuration for negotiating a [`Session`].
pub struct SessionConfig {
    /// The local address. For initiated client streams this is our JID;
    /// for received streams it is the address we serve.
    pub local: Jid,
    /// The remote address. Received streams may leave this at the default
    /// and learn the peer address during negotiation.
    pub remote: Jid,
    /// The stream class.
    pub peer: Peer,
    /// The default `xml:lang` advertised on the stream header.
    pub lang: Option<String>,
    /// The stream features available for negotiation, in advertisement
    /// order.
    pub features: Vec<Box<dyn StreamFeature>>,
}

impl SessionConfig {
    /// Configuration for a stream whose peer address is the domain of
    /// `local`: the common case both for connecting clients and for
    /// servers accepting them.
    pub fn client(local: Jid) -> SessionConfig {
        let remote = local.domain();
        SessionConfig {
            local,
            remote,
            peer: Peer::Client,
            lang: None,
            features: Vec::new(),
        }
    }

    /// Configuration for a server-to-server stream.
    pub fn server(local: Jid, remote: Jid) -> SessionConfig {
        SessionConfig {
            local,
            remote,
            peer: Peer::Server,
            lang: None,
            features: Vec::new(),
        }
    }

    /// Sets the stream language.
    pub fn lang(mut self, lang: impl Into<String>) -> SessionConfig {
        self.lang = Some(lang.into());
        self
    }

    /// Appends a stream feature. Order matters: the responder advertises
    /// features in this order and the initiator prefers earlier ones.
    pub fn feature(mut self, feature: impl StreamFeature + 'static) -> SessionConfig {
        self.features.push(Box::new(feature));
        self
    }
}

/// An established XMPP session over one byte transport.
pub struct Session {
    local: Jid,
    remote: Jid,
    ns: &'static str,
    info: Option<StreamInfo>,
    state: AtomicU8,
    features: StdMutex<HashMap<String, Option<FeatureData>>>,
    pending: StdMutex<HashMap<String, oneshot::Sender<IqHandoff>>>,
    input: Mutex<InputStream>,
    output: Mutex<OutputStream>,
}

impl Session {
    /// Initiates a stream over `transport`, negotiates the configured
    /// features, and returns the established session.
    pub async fn negotiate(
        cfg: SessionConfig,
        transport: impl AsyncReadAndWrite + 'static,
    ) -> Result<Session, Error> {
        let stream = NegotiateStream::new(
            Box::new(transport),
            SessionState::EMPTY,
            cfg.local,
            cfg.remote,
            cfg.peer.content_ns(),
            cfg.lang,
        );
        let stream = negotiate::run(stream, &cfg.features).await?;
        Ok(Session::from_stream(stream))
    }

    /// Accepts a stream initiated by the peer, negotiates the configured
    /// features, and returns the established session.
    pub async fn accept(
        cfg: SessionConfig,
        transport: impl AsyncReadAndWrite + 'static,
    ) -> Result<Session, Error> {
        let stream = NegotiateStream::new(
            Box::new(transport),
            SessionState::RECEIVED,
            cfg.local,
            cfg.remote,
            cfg.peer.content_ns(),
            cfg.lang,
        );
        let stream = negotiate::run(stream, &cfg.features).await?;
        Ok(Session::from_stream(stream))
    }

    fn from_stream(stream: NegotiateStream) -> Session {
        Session {
            local: stream.local,
            remote: stream.remote,
            ns: stream.ns,
            info: stream.peer_info,
            state: AtomicU8::new(stream.state.bits()),
            features: StdMutex::new(stream.advertised),
            pending: StdMutex::new(HashMap::new()),
            input: Mutex::new(stream.input),
            output: Mutex::new(stream.output),
        }
    }

    /// Binds a session directly over a transport without any negotiation.
    ///
    /// The tokenizer is positioned at the start of a document; the peer is
    /// expected to open with a plain stream header (or to be a test
    /// harness feeding stanzas directly).
    #[cfg(test)]
    pub(crate) fn over(
        state: SessionState,
        transport: crate::xmlstream::Transport,
        local: Jid,
        remote: Jid,
        content_ns: &'static str,
    ) -> Session {
        let (rh, wh) = tokio::io::split(transport);
        Session {
            local,
            remote,
            ns: content_ns,
            info: None,
            state: AtomicU8::new(state.bits()),
            features: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            input: Mutex::new(InputStream::new(rh)),
            output: Mutex::new(OutputStream::new(wh, content_ns)),
        }
    }

    /// The current session state bits.
    pub fn state(&self) -> SessionState {
        SessionState::from_bits(self.state.load(Ordering::Acquire))
    }

    fn or_state(&self, bits: SessionState) -> SessionState {
        SessionState::from_bits(self.state.fetch_or(bits.bits(), Ordering::AcqRel))
    }

    /// The local address. After client resource binding this is the full
    /// JID the server assigned.
    pub fn local(&self) -> &Jid {
        &self.local
    }

    /// The remote address.
    pub fn remote(&self) -> &Jid {
        &self.remote
    }

    /// The stream content namespace (`jabber:client` or `jabber:server`).
    pub fn content_ns(&self) -> &'static str {
        self.ns
    }

    /// The peer's stream header from the final negotiation round.
    pub fn peer_info(&self) -> Option<&StreamInfo> {
        self.info.as_ref()
    }

    /// Looks up a feature advertised for this session by namespace.
    ///
    /// The outer `Option` states whether the feature was advertised at
    /// all; the inner one carries the datum its `parse` operation
    /// returned, if the feature was one we support.
    pub fn feature(&self, namespace: &str) -> Option<Option<FeatureData>> {
        self.features.lock().unwrap().get(namespace).cloned()
    }

    /// Reads one XML token from the input half.
    ///
    /// Fails with [`Error::InputStreamClosed`] once the input stream has
    /// been closed.
    pub async fn token(&self) -> Result<Option<Event>, Error> {
        let mut input = self.input.lock().await;
        if self.state().contains(SessionState::INPUT_STREAM_CLOSED) {
            return Err(Error::InputStreamClosed);
        }
        Ok(input.next_event().await?)
    }

    /// Acquires the output half for direct token writing.
    pub async fn token_writer(&self) -> TokenWriter<'_> {
        TokenWriter {
            session: self,
            guard: self.output.lock().await,
        }
    }

    /// Sends one stanza (or other stream-level element) given as an item
    /// stream.
    ///
    /// The stream must begin with a start element.
    pub async fn send<'x, I>(&self, items: I) -> Result<(), Error>
    where
        I: Iterator<Item = ItemResult<'x>> + Send,
    {
        let mut items = items.peekable();
        match items.peek() {
            Some(Ok(Item::ElementHeadStart(_, _))) => (),
            Some(Err(_)) => match items.next() {
                Some(Err(e)) => return Err(ProtocolError::Parse(e).into()),
                _ => unreachable!(),
            },
            _ => return Err(ProtocolError::NotStart.into()),
        }

        let mut output = self.output.lock().await;
        if self.state().contains(SessionState::OUTPUT_STREAM_CLOSED) {
            return Err(Error::OutputStreamClosed);
        }
        output.encode_items(items)?;
        output.flush().await?;
        Ok(())
    }

    /// Closes the session.
    ///
    /// Both stream-closed bits are set, the stream footer is written, and
    /// the transport's write side is shut down. Closing an already closed
    /// session is a no-op.
    pub async fn close(&self) -> Result<(), Error> {
        let previous = self.or_state(
            SessionState::INPUT_STREAM_CLOSED | SessionState::OUTPUT_STREAM_CLOSED,
        );
        if previous.contains(SessionState::OUTPUT_STREAM_CLOSED) {
            return Ok(());
        }
        let mut output = self.output.lock().await;
        output.append_raw(b"</stream:stream>");
        output.flush().await?;
        output.shutdown().await?;
        Ok(())
    }

    /// Serves the inbound side of the session.
    ///
    /// Stanzas are read one at a time and dispatched: `iq` responses with
    /// a waiting [`send_iq`][`Session::send_iq`] caller are handed to that
    /// caller; everything else goes to `handler`. An `iq` of type `get` or
    /// `set` which the handler does not answer (see
    /// [`Handler`]) is answered with a `service-unavailable` error
    /// automatically.
    ///
    /// The loop runs until the peer closes the stream (the normal,
    /// quiescent termination, returned as `Ok`), or until a stream error
    /// or I/O failure occurs. On the way out the stream footer is written
    /// and the session is closed.
    pub async fn serve(&self, mut handler: Option<&mut dyn Handler>) -> Result<(), Error> {
        let result = {
            let mut input = self.input.lock().await;
            self.serve_inner(&mut input, &mut handler).await
        };

        // Unblock any send_iq callers still waiting for a response.
        self.pending.lock().unwrap().clear();

        if let Err(Error::SentStream(ref se)) = result {
            let mut output = self.output.lock().await;
            if !self.state().contains(SessionState::OUTPUT_STREAM_CLOSED) {
                let _ = output.encode_xso(se);
                let _ = output.flush().await;
            }
        }
        let _ = self.close().await;
        result
    }

    async fn serve_inner(
        &self,
        input: &mut InputStream,
        handler: &mut Option<&mut dyn Handler>,
    ) -> Result<(), Error> {
        loop {
            if self.state().contains(SessionState::INPUT_STREAM_CLOSED) {
                return Ok(());
            }
            let ev = match input.next_event().await {
                Ok(Some(ev)) => ev,
                Ok(None) => return Ok(()),
                Err(ref e) if Error::is_eof(e) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            match ev {
                Event::XmlDeclaration(_, _) => continue,
                Event::Text(_, text) if xso::is_xml_whitespace(text.as_bytes()) => continue,
                Event::Text(_, _) => {
                    return Err(Error::SentStream(DefinedCondition::BadFormat.into()));
                }
                Event::EndElement(_) => {
                    // The peer closed the stream.
                    self.or_state(SessionState::INPUT_STREAM_CLOSED);
                    return Ok(());
                }
                Event::StartElement(_, name, mut attrs) => {
                    if name.0 == ns::STREAM && name.1 == "error" {
                        let err: StreamError =
                            xmlstream::read_xso_rest(input, name, attrs).await?;
                        self.or_state(SessionState::INPUT_STREAM_CLOSED);
                        return Err(Error::ReceivedStream(err));
                    }
                    match Stanza::parse(self.ns, &name, &mut attrs) {
                        Some(stanza) => {
                            self.dispatch(input, handler, stanza, attrs).await?;
                        }
                        None => {
                            log::debug!("skipping unknown stream element {}", name.1);
                            xmlstream::skip_element(input).await?;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        input: &mut InputStream,
        handler: &mut Option<&mut dyn Handler>,
        stanza: Stanza,
        extra_attrs: AttrMap,
    ) -> Result<(), Error> {
        // Responses to in-flight iq requests go to their waiters.
        if let Stanza::Iq(ref iq) = stanza {
            if matches!(iq.type_, IqType::Result | IqType::Error) && !iq.id.is_empty() {
                let waiter = self.pending.lock().unwrap().remove(&iq.id);
                if let Some(waiter) = waiter {
                    return self.handoff(input, stanza, extra_attrs, waiter).await;
                }
            }
        }

        let is_request = matches!(&stanza, Stanza::Iq(iq) if iq.type_.is_request());
        let mut rw = TokenReadWriter::new(self, input, &stanza);
        let result = match handler {
            Some(handler) => handler.handle_xmpp(&mut rw).await,
            None => Ok(()),
        };
        rw.drain().await?;
        let replied = rw.replied();
        drop(rw);
        result?;

        if is_request && !replied {
            let (id, to) = match &stanza {
                Stanza::Iq(iq) => (iq.id.clone(), iq.from.clone()),
                _ => unreachable!(),
            };
            let reply = stanza::Iq {
                id,
                to,
                from: None,
                lang: None,
                type_: IqType::Error,
            };
            let error = StanzaError::service_unavailable().to_items(self.ns);
            let items = stanza::wrap_iq(self.ns, &reply, error);
            let mut output = self.output.lock().await;
            if !self.state().contains(SessionState::OUTPUT_STREAM_CLOSED) {
                output.encode_items(items)?;
                output.flush().await?;
            }
        }
        Ok(())
    }
}

/// Exclusive access to the session's output half.
pub struct TokenWriter<'a> {
    session: &'a Session,
    guard: tokio::sync::MutexGuard<'a, OutputStream>,
}

impl TokenWriter<'_> {
    /// Serialises one item.
    pub fn write(&mut self, item: &Item<'_>) -> Result<(), Error> {
        if self
            .session
            .state()
            .contains(SessionState::OUTPUT_STREAM_CLOSED)
        {
            return Err(Error::OutputStreamClosed);
        }
        Ok(self.guard.encode(item)?)
    }

    /// Serialises a whole item stream.
    pub fn write_all<'x, I>(&mut self, items: I) -> Result<(), Error>
    where
        I: Iterator<Item = ItemResult<'x>>,
    {
        for item in items {
            let item = item.map_err(ProtocolError::Parse)?;
            self.write(&item)?;
        }
        Ok(())
    }

    /// Flushes buffered output to the transport.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if self
            .session
            .state()
            .contains(SessionState::OUTPUT_STREAM_CLOSED)
        {
            return Err(Error::OutputStreamClosed);
        }
        Ok(self.guard.flush().await?)
    }
}

/// Handles inbound stanzas dispatched by [`Session::serve`].
///
/// The handler is invoked once per stanza with a [`TokenReadWriter`]
/// scoped to it. Before returning, a handler must have written a
/// well-formed reply for any `get` or `set` iq it accepted; otherwise the
/// session answers with a `service-unavailable` error iq of the same id.
/// The passed reader is only valid for the duration of the call; any
/// tokens left unread when the handler returns are discarded.
pub trait Handler: Send {
    /// Handles one inbound stanza.
    fn handle_xmpp<'a>(
        &'a mut self,
        rw: &'a mut TokenReadWriter<'_>,
    ) -> BoxFuture<'a, Result<(), Error>>;
}

/// Adapts a plain function to the [`Handler`] trait.
pub struct HandlerFunc(
    /// The wrapped handler function.
    pub for<'a, 'b> fn(&'a mut TokenReadWriter<'b>) -> BoxFuture<'a, Result<(), Error>>,
);

impl Handler for HandlerFunc {
    fn handle_xmpp<'a>(
        &'a mut self,
        rw: &'a mut TokenReadWriter<'_>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        (self.0)(rw)
    }
}

struct ReplySniff {
    is_iq: bool,
    id: Option<String>,
    type_: Option<String>,
}

/// A token reader scoped to one inbound stanza, plus write access to the
/// session's output half.
///
/// Reading yields the tokens inside the stanza element and ends (returns
/// `None`) at its closing tag. Writing goes to the session output under
/// its mutex; replies written here are matched against the stanza id so
/// the serve loop knows whether an iq request was answered.
pub struct TokenReadWriter<'a> {
    session: &'a Session,
    input: &'a mut InputStream,
    stanza: &'a Stanza,
    depth: usize,
    done: bool,
    replied: bool,
    wdepth: usize,
    sniff: Option<ReplySniff>,
}

impl<'a> TokenReadWriter<'a> {
    fn new(
        session: &'a Session,
        input: &'a mut InputStream,
        stanza: &'a Stanza,
    ) -> TokenReadWriter<'a> {
        TokenReadWriter {
            session,
            input,
            stanza,
            depth: 0,
            done: false,
            replied: false,
            wdepth: 0,
            sniff: None,
        }
    }

    /// The envelope of the stanza being handled.
    pub fn stanza(&self) -> &Stanza {
        self.stanza
    }

    /// The stream content namespace, as needed by the
    /// [`stanza`][`crate::stanza`] builders.
    pub fn content_ns(&self) -> &'static str {
        self.session.ns
    }

    /// Reads the next token of the stanza payload.
    ///
    /// Returns `None` once the stanza's end element has been consumed.
    pub async fn token(&mut self) -> Result<Option<Event>, Error> {
        if self.done {
            return Ok(None);
        }
        let ev = self.input.next_event().await?.ok_or_else(eof_error)?;
        match &ev {
            Event::StartElement(_, _, _) => self.depth += 1,
            Event::EndElement(_) => {
                if self.depth == 0 {
                    self.done = true;
                    return Ok(None);
                }
                self.depth -= 1;
            }
            _ => (),
        }
        Ok(Some(ev))
    }

    /// Pushes one token back; the next [`token`][`Self::token`] call
    /// returns it again.
    pub fn unget(&mut self, ev: Event) {
        match &ev {
            Event::StartElement(_, _, _) => self.depth -= 1,
            Event::EndElement(_) => self.depth += 1,
            _ => (),
        }
        self.input.unget(ev);
    }

    /// Writes an item stream to the session output and flushes it.
    pub async fn send<'x, I>(&mut self, items: I) -> Result<(), Error>
    where
        I: Iterator<Item = ItemResult<'x>>,
    {
        let mut output = self.session.output.lock().await;
        if self
            .session
            .state()
            .contains(SessionState::OUTPUT_STREAM_CLOSED)
        {
            return Err(Error::OutputStreamClosed);
        }
        for item in items {
            let item = item.map_err(ProtocolError::Parse)?;
            self.sniff_item(&item);
            output.encode(&item)?;
        }
        output.flush().await?;
        Ok(())
    }

    /// Whether a reply matching the stanza id has been written.
    pub(crate) fn replied(&self) -> bool {
        self.replied
    }

    /// Consumes any tokens of the stanza the handler left unread.
    pub(crate) async fn drain(&mut self) -> Result<(), Error> {
        while self.token().await?.is_some() {}
        Ok(())
    }

    fn sniff_item(&mut self, item: &Item<'_>) {
        match item {
            Item::ElementHeadStart(_, name) => {
                if self.wdepth == 0 {
                    self.sniff = Some(ReplySniff {
                        is_iq: &**name == "iq",
                        id: None,
                        type_: None,
                    });
                }
                self.wdepth += 1;
            }
            Item::Attribute(_, name, value) => {
                if self.wdepth == 1 {
                    if let Some(sniff) = &mut self.sniff {
                        if &**name == "id" {
                            sniff.id = Some(value.to_string());
                        } else if &**name == "type" {
                            sniff.type_ = Some(value.to_string());
                        }
                    }
                }
            }
            Item::ElementHeadEnd => {
                if self.wdepth == 1 {
                    self.finish_sniff();
                }
            }
            Item::ElementFoot => {
                if self.wdepth == 1 {
                    self.finish_sniff();
                }
                self.wdepth = self.wdepth.saturating_sub(1);
            }
            _ => (),
        }
    }

    fn finish_sniff(&mut self) {
        let Some(sniff) = self.sniff.take() else {
            return;
        };
        let request_id = match self.stanza {
            Stanza::Iq(iq) => iq.id.as_str(),
            _ => return,
        };
        let is_reply_type = matches!(sniff.type_.as_deref(), Some("result") | Some("error"));
        if sniff.is_iq && is_reply_type && sniff.id.as_deref() == Some(request_id) {
            self.replied = true;
        }
    }
}
