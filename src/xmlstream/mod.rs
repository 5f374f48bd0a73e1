//! XML token stream plumbing.
//!
//! This module binds the byte transport to the XML tokenizer and isolates
//! the rest of the crate from it: reading yields [`rxml::Event`]s through an
//! [`InputStream`], writing drains [`xso::Item`]s through an
//! [`OutputStream`]. The two halves are independent so that one task can
//! read stanzas while another writes, and both can be unbound and rebound
//! when stream negotiation swaps the underlying transport.

use core::pin::Pin;
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use futures::future::poll_fn;
use rxml::{xml_ncname, AttrMap, Event, NcNameStr, Parser, QName};
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, ReadHalf, WriteHalf,
};
use xso::{AsXml, FromEventsBuilder, FromXml, Item};

use crate::error::{Error, ProtocolError};
use crate::ns;

/// A byte transport suitable for carrying an XMPP stream.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// The boxed transport a session runs over.
///
/// Stream features may replace the transport mid-negotiation (for example
/// the TLS upgrade), so the concrete type is erased.
pub type Transport = Box<dyn AsyncReadAndWrite>;

/// One serialised XML item, or the error that producing it raised.
pub type ItemResult<'x> = Result<Item<'x>, xso::error::Error>;

/// Returns an empty payload for the `wrap_*` stanza builders.
pub fn empty<'x>() -> core::iter::Empty<ItemResult<'x>> {
    core::iter::empty()
}

/// Re-lends a longer-lived item stream at a shorter lifetime so it can be
/// chained with envelope items borrowing local data.
pub(crate) fn reborrow<'short, 'long: 'short, I>(
    items: I,
) -> impl Iterator<Item = ItemResult<'short>> + Send + use<'short, 'long, I>
where
    I: Iterator<Item = ItemResult<'long>> + Send,
{
    items.map(|item| -> ItemResult<'short> { item })
}

pub(crate) fn eof_error() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "unexpected end of stream inside an element",
    ))
}

/// The head of an element emitted by [`wrap`]: its name and attributes.
pub struct Head<'x> {
    ns: &'static str,
    name: &'x NcNameStr,
    attrs: Vec<(Option<&'static str>, &'x NcNameStr, std::borrow::Cow<'x, str>)>,
}

impl<'x> Head<'x> {
    /// Starts an element head with the given namespace and local name.
    pub fn new(ns: &'static str, name: &'x NcNameStr) -> Head<'x> {
        Head {
            ns,
            name,
            attrs: Vec::new(),
        }
    }

    /// Appends an attribute without a namespace.
    pub fn attr(
        mut self,
        name: &'x NcNameStr,
        value: impl Into<std::borrow::Cow<'x, str>>,
    ) -> Head<'x> {
        self.attrs.push((None, name, value.into()));
        self
    }

    /// Appends an `xml:lang` attribute.
    pub fn lang(mut self, value: impl Into<std::borrow::Cow<'x, str>>) -> Head<'x> {
        self.attrs.push((Some(ns::XML), xml_ncname!("lang"), value.into()));
        self
    }

    fn into_items(self) -> impl Iterator<Item = ItemResult<'x>> + Send {
        let start = Item::ElementHeadStart(
            rxml::Namespace::from(self.ns),
            std::borrow::Cow::Borrowed(self.name),
        );
        let attrs = self.attrs.into_iter().map(|(ns, name, value)| {
            let ns = match ns {
                Some(ns) => rxml::Namespace::from(ns),
                None => rxml::Namespace::NONE,
            };
            Item::Attribute(ns, std::borrow::Cow::Borrowed(name), value)
        });
        core::iter::once(start)
            .chain(attrs)
            .chain(core::iter::once(Item::ElementHeadEnd))
            .map(Ok)
    }
}

/// Wraps a payload item stream in an element.
///
/// The returned stream yields the element head described by `head`, then
/// every payload item, then the matching end element. The payload is not
/// inspected or buffered; it is pulled lazily as the result is drained.
pub fn wrap<'x, I>(head: Head<'x>, payload: I) -> impl Iterator<Item = ItemResult<'x>> + Send
where
    I: Iterator<Item = ItemResult<'x>> + Send,
{
    head.into_items()
        .chain(payload)
        .chain(core::iter::once(Ok(Item::ElementFoot)))
}

/// Drains an item stream into a session's [`TokenWriter`] and flushes it,
/// failing with the source's error if the source fails.
///
///   [`TokenWriter`]: crate::TokenWriter
pub async fn copy<'x, I>(
    writer: &mut crate::session::TokenWriter<'_>,
    items: I,
) -> Result<(), Error>
where
    I: Iterator<Item = ItemResult<'x>>,
{
    writer.write_all(items)?;
    writer.flush().await
}

/// The reading half: tokenizer state bound to the transport's read side.
pub(crate) struct InputStream {
    reader: rxml::AsyncReader<BufReader<ReadHalf<Transport>>>,
    pushback: Option<Event>,
}

impl InputStream {
    pub(crate) fn new(rh: ReadHalf<Transport>) -> InputStream {
        InputStream {
            reader: rxml::AsyncReader::wrap(BufReader::new(rh), Parser::default()),
            pushback: None,
        }
    }

    /// Reads the next XML event. XML declarations are skipped; the parser
    /// itself rejects a declaration anywhere but at the stream start.
    ///
    /// `Ok(None)` means the document (and therefore the stream) has ended.
    pub(crate) async fn next_event(&mut self) -> io::Result<Option<Event>> {
        if let Some(ev) = self.pushback.take() {
            return Ok(Some(ev));
        }
        loop {
            let ev = poll_fn(|cx| Pin::new(&mut self.reader).poll_read(cx)).await?;
            match ev {
                Some(Event::XmlDeclaration(_, _)) => continue,
                other => return Ok(other),
            }
        }
    }

    /// Pushes one event back; the next [`next_event`][`Self::next_event`]
    /// call returns it again. At most one event can be held back.
    pub(crate) fn unget(&mut self, ev: Event) {
        debug_assert!(self.pushback.is_none(), "double unget");
        self.pushback = Some(ev);
    }

    /// Discards all parser state, keeping buffered transport bytes.
    ///
    /// Used for stream restarts which keep the transport (eg. after SASL).
    pub(crate) fn reset(&mut self) {
        *Pin::new(&mut self.reader).parser_pinned() = Parser::default();
        self.pushback = None;
    }

    /// Tears the tokenizer down, returning any bytes it had buffered but
    /// not parsed together with the transport's read half.
    ///
    /// The buffered bytes must be replayed in front of the new transport;
    /// on a TLS upgrade they may already contain the start of the peer's
    /// handshake.
    pub(crate) fn dismantle(self) -> (Vec<u8>, ReadHalf<Transport>) {
        let (buffered, _parser) = self.reader.into_inner();
        let leftover = buffered.buffer().to_vec();
        (leftover, buffered.into_inner())
    }
}

/// The writing half: encoder state plus the transport's write side.
pub(crate) struct OutputStream {
    writer: WriteHalf<Transport>,
    encoder: rxml::writer::Encoder<rxml::writer::SimpleNamespaces>,
    buf: BytesMut,
    ns: &'static str,
}

fn new_encoder(ns: &'static str) -> rxml::writer::Encoder<rxml::writer::SimpleNamespaces> {
    use rxml::writer::TrackNamespace;

    let mut encoder = rxml::writer::Encoder::new();
    encoder
        .ns_tracker_mut()
        .declare_fixed(Some(xml_ncname!("stream")), ns::STREAM.into());
    encoder.ns_tracker_mut().declare_fixed(None, ns.into());
    encoder
}

impl OutputStream {
    pub(crate) fn new(writer: WriteHalf<Transport>, ns: &'static str) -> OutputStream {
        OutputStream {
            writer,
            encoder: new_encoder(ns),
            buf: BytesMut::new(),
            ns,
        }
    }

    /// The default namespace the encoder assumes to be in scope.
    pub(crate) fn stream_ns(&self) -> &'static str {
        self.ns
    }

    /// Serialises one item into the output buffer.
    pub(crate) fn encode(&mut self, item: &Item<'_>) -> io::Result<()> {
        self.encoder
            .encode_into_bytes(item.as_rxml_item(), &mut self.buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    /// Serialises a whole item stream into the output buffer.
    pub(crate) fn encode_items<'x, I>(&mut self, items: I) -> Result<(), Error>
    where
        I: Iterator<Item = ItemResult<'x>>,
    {
        for item in items {
            let item = item.map_err(ProtocolError::Parse)?;
            self.encode(&item)?;
        }
        Ok(())
    }

    /// Serialises an [`AsXml`] value into the output buffer.
    pub(crate) fn encode_xso<T: AsXml>(&mut self, value: &T) -> Result<(), Error> {
        let iter = value.as_xml_iter().map_err(ProtocolError::Parse)?;
        for item in iter {
            let item = item.map_err(ProtocolError::Parse)?;
            self.encode(&item)?;
        }
        Ok(())
    }

    /// Appends raw bytes to the output buffer.
    ///
    /// This is how the hand-formatted stream header and footer are written;
    /// the encoder's fixed namespace declarations are kept consistent with
    /// what the header declares on the wire.
    pub(crate) fn append_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes the buffered bytes to the transport and flushes it.
    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        while !self.buf.is_empty() {
            let n = self.writer.write(&self.buf).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.buf.advance(n);
        }
        self.writer.flush().await
    }

    /// Shuts down the write side of the transport.
    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    /// Discards all encoder state for a stream restart.
    pub(crate) fn reset(&mut self) {
        self.encoder = new_encoder(self.ns);
        self.buf.clear();
    }

    pub(crate) fn into_write_half(self) -> WriteHalf<Transport> {
        self.writer
    }
}

/// Consumes events up to and including the end of the current element.
///
/// The element's start event must already have been consumed.
pub(crate) async fn skip_element(input: &mut InputStream) -> Result<(), Error> {
    let mut depth = 0usize;
    loop {
        match input.next_event().await?.ok_or_else(eof_error)? {
            Event::StartElement(_, _, _) => depth += 1,
            Event::EndElement(_) => match depth {
                0 => return Ok(()),
                _ => depth -= 1,
            },
            _ => (),
        }
    }
}

/// Reads one [`FromXml`] element from the stream, skipping leading XML
/// whitespace.
pub(crate) async fn read_xso<T: FromXml>(input: &mut InputStream) -> Result<T, Error> {
    loop {
        match input.next_event().await?.ok_or_else(eof_error)? {
            Event::Text(_, text) if xso::is_xml_whitespace(text.as_bytes()) => continue,
            Event::StartElement(_, name, attrs) => {
                return read_xso_rest(input, name, attrs).await;
            }
            _ => return Err(ProtocolError::InvalidToken.into()),
        }
    }
}

/// Completes reading a [`FromXml`] element whose start event has already
/// been consumed.
///
/// Parsing goes through the fallible `Result` builder so that on a schema
/// mismatch the whole subtree is consumed anyway and the stream stays at
/// the element boundary (recoverable parse errors).
pub(crate) async fn read_xso_rest<T: FromXml>(
    input: &mut InputStream,
    name: QName,
    attrs: AttrMap,
) -> Result<T, Error> {
    let ctx = xso::Context::empty();
    let mut builder = <Result<T, xso::error::Error> as FromXml>::from_events(name, attrs, &ctx)
        .map_err(|e| match e {
            xso::error::FromEventsError::Mismatch { .. } => {
                ProtocolError::Parse(xso::error::Error::TypeMismatch)
            }
            xso::error::FromEventsError::Invalid(e) => ProtocolError::Parse(e),
        })?;
    loop {
        let ev = input.next_event().await?.ok_or_else(eof_error)?;
        match builder.feed(ev, &ctx).map_err(ProtocolError::Parse)? {
            Some(Ok(value)) => return Ok(value),
            Some(Err(e)) => return Err(ProtocolError::Parse(e).into()),
            None => (),
        }
    }
}

/// A transport wrapper replaying bytes the old tokenizer had buffered.
///
/// When the transport is swapped during a stream restart, bytes the peer
/// pipelined behind the restart barrier may already sit in the read buffer.
/// They belong to the new transport layer and are replayed ahead of it.
pub(crate) struct Prepend<T> {
    head: Bytes,
    inner: T,
}

impl<T> Prepend<T> {
    pub(crate) fn new(head: Vec<u8>, inner: T) -> Prepend<T> {
        Prepend {
            head: Bytes::from(head),
            inner,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Prepend<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut core::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> core::task::Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.head.is_empty() {
            let n = this.head.len().min(buf.remaining());
            let chunk = this.head.split_to(n);
            buf.put_slice(&chunk);
            return core::task::Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Prepend<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut core::task::Context<'_>,
        buf: &[u8],
    ) -> core::task::Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut core::task::Context<'_>,
    ) -> core::task::Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut core::task::Context<'_>,
    ) -> core::task::Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;

    fn transport(io: impl AsyncReadAndWrite + 'static) -> Transport {
        Box::new(io)
    }

    #[tokio::test]
    async fn prepend_replays_head_before_inner() {
        let (lhs, mut rhs) = tokio::io::duplex(1024);
        rhs.write_all(b" world").await.unwrap();
        drop(rhs);

        let mut io = Prepend::new(b"hello".to_vec(), lhs);
        let mut out = Vec::new();
        io.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn input_stream_yields_events_and_ungets() {
        let (lhs, mut rhs) = tokio::io::duplex(1024);
        rhs.write_all(b"<root><a/></root>").await.unwrap();
        drop(rhs);

        let (rh, _wh) = tokio::io::split(transport(lhs));
        let mut input = InputStream::new(rh);

        let root = match input.next_event().await.unwrap() {
            Some(ev @ Event::StartElement(_, _, _)) => ev,
            other => panic!("unexpected event: {:?}", other),
        };
        input.unget(root);
        match input.next_event().await.unwrap() {
            Some(Event::StartElement(_, (_, name), _)) => assert_eq!(name, "root"),
            other => panic!("unexpected event: {:?}", other),
        }
        skip_element(&mut input).await.unwrap();
        assert!(input.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn output_stream_encodes_wrapped_items() {
        let (lhs, mut rhs) = tokio::io::duplex(1024);
        let (rh, wh) = tokio::io::split(transport(lhs));
        let mut output = OutputStream::new(wh, crate::ns::CLIENT);

        let head = Head::new(crate::ns::CLIENT, xml_ncname!("message"))
            .attr(xml_ncname!("type"), "chat");
        output
            .encode_items(wrap(head, empty()))
            .expect("encode failed");
        output.flush().await.unwrap();
        drop(output);
        drop(rh);

        let mut out = Vec::new();
        rhs.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(
            text.contains("message") && text.contains("type=\"chat\""),
            "unexpected serialisation: {}",
            text
        );
    }
}
