//! Stream feature negotiation.
//!
//! The negotiator drives an iterative loop that alternates between header
//! exchange and feature exchange, restarting the stream as many times as a
//! feature requests. A feature may request a plain restart (the transport
//! is kept, the tokenizer state is discarded; SASL does this) or hand back
//! a transport upgrade (the tokenizer is unbound, the transport replaced,
//! and everything rebound; STARTTLS). No task ever holds the tokenizer
//! across a restart boundary: all rebinding happens here, between feature
//! invocations.

use std::any::Any;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use rxml::{xml_ncname, Event, Namespace};
use xso::{AsXml, FromXml, Item};

use crate::error::Error;
use crate::jid::Jid;
use crate::ns;
use crate::session::SessionState;
use crate::stream::error::DefinedCondition;
use crate::stream::{self, OpenConfig, StreamInfo};
use crate::xmlstream::{
    self, eof_error, InputStream, ItemResult, OutputStream, Prepend, Transport,
};

/// The qualified XML name of a stream feature's advertisement element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureName {
    /// The namespace of the advertisement element. Also the key under
    /// which the feature is recorded as negotiated.
    pub ns: &'static str,
    /// The local name of the advertisement element.
    pub local: &'static str,
}

/// Opaque datum a feature's `parse` hands to its `negotiate`.
///
/// The same value is cached on the session and can be retrieved through
/// [`Session::feature`][`crate::Session::feature`] after negotiation.
pub type FeatureData = Arc<dyn Any + Send + Sync>;

/// An asynchronous transport replacement, applied by the negotiator
/// between two streams.
pub type TransportUpgrade =
    Box<dyn FnOnce(Transport) -> BoxFuture<'static, Result<Transport, Error>> + Send>;

/// How the stream continues after a feature finished negotiating.
pub enum Restart {
    /// Continue on the current stream.
    No,
    /// Restart the stream on the same transport (eg. after SASL).
    SameTransport,
    /// Replace the transport, then restart the stream (eg. after TLS).
    Upgrade(TransportUpgrade),
}

/// The outcome of a feature's `negotiate` operation.
pub struct Negotiated {
    /// State bits to OR into the session state.
    pub mask: SessionState,
    /// Whether (and how) the stream restarts.
    pub restart: Restart,
    /// The stream ends politely without a session (eg. the peer answered
    /// STARTTLS with `<failure/>`).
    pub end_stream: bool,
}

impl Negotiated {
    /// An outcome that flips no bits and continues the current stream.
    pub fn none() -> Negotiated {
        Negotiated {
            mask: SessionState::EMPTY,
            restart: Restart::No,
            end_stream: false,
        }
    }
}

/// A pluggable stream negotiation step.
///
/// Features are advertised by the responder in `<stream:features/>` when
/// their [`necessary`][`Self::necessary`] bits are all set and none of
/// their [`prohibited`][`Self::prohibited`] bits is set in the current
/// session state; the same gate applies on the initiator side before
/// `parse` is invoked. Features should be stateless with respect to any
/// single negotiation; per-negotiation data travels through the
/// [`FeatureData`] returned by `parse`.
pub trait StreamFeature: Send + Sync {
    /// The XML name of the feature's advertisement element.
    fn name(&self) -> FeatureName;

    /// Bits that must be set before this feature is advertised.
    fn necessary(&self) -> SessionState {
        SessionState::EMPTY
    }

    /// Bits that must be clear for this feature to be advertised.
    fn prohibited(&self) -> SessionState {
        SessionState::EMPTY
    }

    /// Responder side: write the advertisement element and report whether
    /// negotiating this feature is required.
    fn list<'a>(&'a self, stream: &'a mut NegotiateStream) -> BoxFuture<'a, Result<bool, Error>>;

    /// Initiator side: decode the advertisement element (available as the
    /// next element on the stream) and return whether the feature is
    /// required along with any datum `negotiate` will need.
    fn parse<'a>(
        &'a self,
        stream: &'a mut NegotiateStream,
    ) -> BoxFuture<'a, Result<(bool, Option<FeatureData>), Error>>;

    /// Runs the feature to completion on either side.
    ///
    /// On the responder side the peer's feature selection element is
    /// available as the next element on the stream.
    fn negotiate<'a>(
        &'a self,
        stream: &'a mut NegotiateStream,
        data: Option<FeatureData>,
    ) -> BoxFuture<'a, Result<Negotiated, Error>>;
}

fn gate_passes(feature: &dyn StreamFeature, state: SessionState) -> bool {
    state.contains(feature.necessary()) && (state & feature.prohibited()).is_empty()
}

/// The stream object features negotiate over.
///
/// It owns both token halves exclusively: negotiation is strictly
/// sequential, so no locking is involved until the finished stream is
/// turned into a [`Session`][`crate::Session`].
pub struct NegotiateStream {
    pub(crate) input: InputStream,
    pub(crate) output: OutputStream,
    pub(crate) state: SessionState,
    pub(crate) local: Jid,
    pub(crate) remote: Jid,
    pub(crate) ns: &'static str,
    pub(crate) lang: Option<String>,
    pub(crate) peer_info: Option<StreamInfo>,
    pub(crate) advertised: HashMap<String, Option<FeatureData>>,
}

impl NegotiateStream {
    pub(crate) fn new(
        transport: Transport,
        state: SessionState,
        local: Jid,
        remote: Jid,
        content_ns: &'static str,
        lang: Option<String>,
    ) -> NegotiateStream {
        let (rh, wh) = tokio::io::split(transport);
        NegotiateStream {
            input: InputStream::new(rh),
            output: OutputStream::new(wh, content_ns),
            state,
            local,
            remote,
            ns: content_ns,
            lang,
            peer_info: None,
            advertised: HashMap::new(),
        }
    }

    /// The current session state bits.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The local address.
    pub fn local(&self) -> &Jid {
        &self.local
    }

    /// The remote address.
    pub fn remote(&self) -> &Jid {
        &self.remote
    }

    /// Replaces the local address (resource binding does this when the
    /// responder assigns the final full JID).
    pub fn set_local(&mut self, jid: Jid) {
        self.local = jid;
    }

    /// Replaces the remote address.
    pub fn set_remote(&mut self, jid: Jid) {
        self.remote = jid;
    }

    /// The stream content namespace (`jabber:client` or `jabber:server`).
    pub fn content_ns(&self) -> &'static str {
        self.ns
    }

    /// The peer's most recent stream header, if one was received.
    pub fn peer_info(&self) -> Option<&StreamInfo> {
        self.peer_info.as_ref()
    }

    /// Reads the next XML event.
    pub async fn next_event(&mut self) -> Result<Option<Event>, Error> {
        Ok(self.input.next_event().await?)
    }

    /// Pushes one event back onto the stream.
    pub fn unget(&mut self, ev: Event) {
        self.input.unget(ev);
    }

    /// Reads one element from the stream into a [`FromXml`] type.
    pub async fn read_xso<T: FromXml>(&mut self) -> Result<T, Error> {
        xmlstream::read_xso(&mut self.input).await
    }

    /// Skips the remainder of the current element.
    pub async fn skip_element(&mut self) -> Result<(), Error> {
        xmlstream::skip_element(&mut self.input).await
    }

    /// Serialises an [`AsXml`] value and flushes it to the peer.
    pub async fn send_xso<T: AsXml>(&mut self, value: &T) -> Result<(), Error> {
        self.output.encode_xso(value)?;
        Ok(self.output.flush().await?)
    }

    /// Serialises an item stream and flushes it to the peer.
    pub async fn send_items<'x, I>(&mut self, items: I) -> Result<(), Error>
    where
        I: Iterator<Item = ItemResult<'x>>,
    {
        self.output.encode_items(items)?;
        Ok(self.output.flush().await?)
    }

    /// Reports a locally detected stream error to the peer and closes the
    /// output stream, then hands the error back for propagation.
    pub(crate) async fn fail(&mut self, e: Error) -> Error {
        if let Error::SentStream(ref se) = e {
            let _ = stream::send_error(&mut self.output, se).await;
            self.output.append_raw(b"</stream:stream>");
            let _ = self.output.flush().await;
        }
        e
    }

    /// Applies a restart decision, yielding the stream for the next
    /// header exchange.
    pub(crate) async fn restart(self, restart: Restart) -> Result<NegotiateStream, Error> {
        match restart {
            Restart::No | Restart::SameTransport => {
                let mut stream = self;
                stream.input.reset();
                stream.output.reset();
                Ok(stream)
            }
            Restart::Upgrade(upgrade) => {
                let NegotiateStream {
                    input,
                    output,
                    state,
                    local,
                    remote,
                    ns,
                    lang,
                    peer_info,
                    advertised,
                } = self;
                let (leftover, rh) = input.dismantle();
                let wh = output.into_write_half();
                let transport = rh.unsplit(wh);
                let transport: Transport = if leftover.is_empty() {
                    transport
                } else {
                    Box::new(Prepend::new(leftover, transport))
                };
                let transport = upgrade(transport).await?;
                let (rh, wh) = tokio::io::split(transport);
                Ok(NegotiateStream {
                    input: InputStream::new(rh),
                    output: OutputStream::new(wh, ns),
                    state,
                    local,
                    remote,
                    ns,
                    lang,
                    peer_info,
                    advertised,
                })
            }
        }
    }
}

/// One advertised feature, as cached during a single feature exchange.
struct Advertised {
    req: bool,
    data: Option<FeatureData>,
    index: usize,
    ns: String,
}

/// Runs stream negotiation to completion.
///
/// On success the stream carries the `Ready` bit and is positioned inside
/// the final stream root, ready to exchange stanzas.
pub(crate) async fn run(
    mut stream: NegotiateStream,
    features: &[Box<dyn StreamFeature>],
) -> Result<NegotiateStream, Error> {
    let mut negotiated: HashSet<String> = HashSet::new();
    let mut pending_restart = Some(Restart::SameTransport);

    loop {
        if let Some(restart) = pending_restart.take() {
            stream = stream.restart(restart).await?;
            exchange_headers(&mut stream).await?;
        }

        let (done, restart) = negotiate_features(&mut stream, features, &mut negotiated).await?;
        if let Some(restart) = restart {
            pending_restart = Some(restart);
            continue;
        }
        if done {
            break;
        }
    }

    stream.state |= SessionState::READY;
    log::debug!(
        "negotiation complete, local={} remote={} state={:?}",
        stream.local,
        stream.remote,
        stream.state
    );
    Ok(stream)
}

async fn exchange_headers(stream: &mut NegotiateStream) -> Result<(), Error> {
    if stream.state.contains(SessionState::RECEIVED) {
        let info = match stream::recv_open(&mut stream.input, false).await {
            Ok(info) => info,
            Err(e) => return Err(stream.fail(e).await),
        };
        // The initiating entity is whoever the header says it is, until
        // authentication or binding refines that.
        if let Some(from) = info.from.clone() {
            stream.remote = from;
        }
        let id = stream::new_stream_id();
        let cfg = OpenConfig {
            to: info.from.as_ref(),
            from: Some(&stream.local),
            id: Some(&id),
            lang: stream.lang.as_deref(),
        };
        stream::send_open(&mut stream.output, cfg).await?;
        stream.peer_info = Some(info);
    } else {
        let cfg = OpenConfig {
            to: Some(&stream.remote),
            from: Some(&stream.local),
            id: None,
            lang: stream.lang.as_deref(),
        };
        stream::send_open(&mut stream.output, cfg).await?;
        let info = match stream::recv_open(&mut stream.input, true).await {
            Ok(info) => info,
            Err(e) => return Err(stream.fail(e).await),
        };
        stream.peer_info = Some(info);
    }
    Ok(())
}

async fn negotiate_features(
    stream: &mut NegotiateStream,
    features: &[Box<dyn StreamFeature>],
    negotiated: &mut HashSet<String>,
) -> Result<(bool, Option<Restart>), Error> {
    let server = stream.state.contains(SessionState::RECEIVED);
    let mut list: Vec<Advertised> = Vec::new();
    let mut any_required = false;
    let mut total = 0usize;

    if server {
        stream.output.encode(&Item::ElementHeadStart(
            Namespace::from(ns::STREAM),
            Cow::Borrowed(xml_ncname!("features")),
        ))?;
        stream.output.encode(&Item::ElementHeadEnd)?;
        for (index, feature) in features.iter().enumerate() {
            if !gate_passes(feature.as_ref(), stream.state) {
                continue;
            }
            let req = feature.list(stream).await?;
            let feature_ns = feature.name().ns.to_owned();
            stream.advertised.entry(feature_ns.clone()).or_insert(None);
            list.push(Advertised {
                req,
                data: None,
                index,
                ns: feature_ns,
            });
            any_required |= req;
            total += 1;
        }
        stream.output.encode(&Item::ElementFoot)?;
        stream.output.flush().await?;

        // Nothing to offer: negotiation is already over, don't block on a
        // selection that cannot come.
        if total == 0 {
            return Ok((true, None));
        }
    } else {
        match stream.next_event().await?.ok_or_else(eof_error)? {
            Event::StartElement(_, name, attrs) => {
                if name.0 != ns::STREAM {
                    let e = Error::SentStream(DefinedCondition::BadNamespacePrefix.into());
                    return Err(stream.fail(e).await);
                }
                if name.1 == "error" {
                    let err = xmlstream::read_xso_rest(&mut stream.input, name, attrs).await?;
                    return Err(Error::ReceivedStream(err));
                }
                if name.1 != "features" {
                    let e = Error::SentStream(DefinedCondition::InvalidXml.into());
                    return Err(stream.fail(e).await);
                }
            }
            _ => {
                let e = Error::SentStream(DefinedCondition::RestrictedXml.into());
                return Err(stream.fail(e).await);
            }
        }

        loop {
            match stream.next_event().await?.ok_or_else(eof_error)? {
                ev @ Event::StartElement(_, _, _) => {
                    total += 1;
                    let (feature_ns, found) = match &ev {
                        Event::StartElement(_, qname, _) => {
                            let found = features.iter().enumerate().find(|(_, f)| {
                                let name = f.name();
                                qname.0 == name.ns
                                    && qname.1 == name.local
                                    && gate_passes(f.as_ref(), stream.state)
                            });
                            (qname.0.to_string(), found.map(|(i, _)| i))
                        }
                        _ => unreachable!(),
                    };

                    // Record every advertised feature, supported or not.
                    stream.advertised.entry(feature_ns.clone()).or_insert(None);

                    match found {
                        Some(index) => {
                            stream.unget(ev);
                            let (req, data) = features[index].parse(stream).await?;
                            stream
                                .advertised
                                .insert(feature_ns.clone(), data.clone());
                            any_required |= req;
                            list.push(Advertised {
                                req,
                                data,
                                index,
                                ns: feature_ns,
                            });
                        }
                        None => stream.skip_element().await?,
                    }
                }
                Event::EndElement(_) => break,
                Event::Text(_, text) if xso::is_xml_whitespace(text.as_bytes()) => continue,
                _ => {
                    let e = Error::SentStream(DefinedCondition::RestrictedXml.into());
                    return Err(stream.fail(e).await);
                }
            }
        }

        // An empty list, or one with nothing we support, means the peer
        // considers negotiation complete.
        if total == 0 || list.is_empty() {
            return Ok((true, None));
        }
    }

    loop {
        let selected = if server {
            let ev = loop {
                match stream.next_event().await?.ok_or_else(eof_error)? {
                    ev @ Event::StartElement(_, _, _) => break ev,
                    Event::Text(_, text) if xso::is_xml_whitespace(text.as_bytes()) => continue,
                    _ => {
                        let e = Error::SentStream(DefinedCondition::BadFormat.into());
                        return Err(stream.fail(e).await);
                    }
                }
            };
            let position = match &ev {
                Event::StartElement(_, qname, _) => list.iter().position(|adv| {
                    let name = features[adv.index].name();
                    qname.0 == name.ns && qname.1 == name.local
                }),
                _ => unreachable!(),
            };
            match position {
                Some(position) if !negotiated.contains(&list[position].ns) => {
                    stream.unget(ev);
                    position
                }
                _ => {
                    // Not advertised, or advertised and already negotiated.
                    let e = Error::SentStream(DefinedCondition::PolicyViolation.into());
                    return Err(stream.fail(e).await);
                }
            }
        } else {
            // Prefer any optional feature; otherwise take the last
            // required one encountered.
            let mut chosen = None;
            for (position, adv) in list.iter().enumerate() {
                if negotiated.contains(&adv.ns) {
                    continue;
                }
                chosen = Some(position);
                if !adv.req {
                    break;
                }
            }
            match chosen {
                Some(position) => position,
                // Everything on offer has been negotiated already.
                None => return Ok((true, None)),
            }
        };

        let adv = &list[selected];
        let feature = &features[adv.index];
        log::debug!("negotiating stream feature {}", adv.ns);
        let outcome = feature.negotiate(stream, adv.data.clone()).await?;
        stream.state |= outcome.mask;
        negotiated.insert(adv.ns.clone());

        if outcome.end_stream {
            stream.output.append_raw(b"</stream:stream>");
            let _ = stream.output.flush().await;
            return Err(Error::Disconnected);
        }

        // A restart, or the completion of a required feature, ends this
        // feature set.
        let requires_exit = adv.req || !matches!(outcome.restart, Restart::No);
        if requires_exit {
            let done = !any_required || stream.state.contains(SessionState::READY);
            let restart = match outcome.restart {
                Restart::No => None,
                restart => Some(restart),
            };
            return Ok((done, restart));
        }
    }
}
