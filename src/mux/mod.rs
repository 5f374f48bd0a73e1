//! Stanza multiplexing.
//!
//! [`ServeMux`] routes inbound stanzas to registered handlers by stanza
//! kind, stanza type, and the qualified name of the first payload child.
//! Lookup falls through from most to least specific:
//! `(kind, type, name)`, `(kind, *, name)`, `(kind, type, *)`,
//! `(kind, *, *)`, then the fallback handler.

use std::collections::HashMap;

use futures::future::{BoxFuture, FutureExt};
use rxml::Event;

use crate::error::Error;
use crate::session::{Handler, TokenReadWriter};
use crate::stanza::error::StanzaError;
use crate::stanza::{self, Iq, IqType, MessageType, PresenceType, Stanza};

/// A payload pattern: the qualified name of the first child element, or
/// the wildcard.
type Payload = Option<(String, String)>;

/// A stanza routing table.
///
/// If no handler matches an `iq` of type `get` or `set`, the multiplexer
/// answers it with a `service-unavailable` error mirroring the request id.
#[derive(Default)]
pub struct ServeMux {
    iq: HashMap<(Option<IqType>, Payload), Box<dyn Handler>>,
    message: HashMap<(Option<MessageType>, Payload), Box<dyn Handler>>,
    presence: HashMap<(Option<PresenceType>, Payload), Box<dyn Handler>>,
    fallback: Option<Box<dyn Handler>>,
}

fn payload_key(payload: Option<(&str, &str)>) -> Payload {
    payload.map(|(ns, local)| (ns.to_owned(), local.to_owned()))
}

impl ServeMux {
    /// An empty routing table.
    pub fn new() -> ServeMux {
        ServeMux::default()
    }

    /// Registers a handler for `iq` stanzas. `None` entries are wildcards.
    pub fn iq(
        mut self,
        type_: Option<IqType>,
        payload: Option<(&str, &str)>,
        handler: impl Handler + 'static,
    ) -> ServeMux {
        self.iq
            .insert((type_, payload_key(payload)), Box::new(handler));
        self
    }

    /// Registers a handler for `message` stanzas.
    pub fn message(
        mut self,
        type_: Option<MessageType>,
        payload: Option<(&str, &str)>,
        handler: impl Handler + 'static,
    ) -> ServeMux {
        self.message
            .insert((type_, payload_key(payload)), Box::new(handler));
        self
    }

    /// Registers a handler for `presence` stanzas.
    pub fn presence(
        mut self,
        type_: Option<PresenceType>,
        payload: Option<(&str, &str)>,
        handler: impl Handler + 'static,
    ) -> ServeMux {
        self.presence
            .insert((type_, payload_key(payload)), Box::new(handler));
        self
    }

    /// Registers the handler of last resort for all stanza kinds.
    pub fn fallback(mut self, handler: impl Handler + 'static) -> ServeMux {
        self.fallback = Some(Box::new(handler));
        self
    }

    fn lookup(
        &mut self,
        stanza: &Stanza,
        payload: &Payload,
    ) -> Option<&mut Box<dyn Handler>> {
        fn select<'m, T: Copy + Eq + std::hash::Hash>(
            table: &'m mut HashMap<(Option<T>, Payload), Box<dyn Handler>>,
            type_: T,
            payload: &Payload,
        ) -> Option<&'m mut Box<dyn Handler>> {
            let candidates: [(Option<T>, Payload); 4] = [
                (Some(type_), payload.clone()),
                (None, payload.clone()),
                (Some(type_), None),
                (None, None),
            ];
            for key in candidates {
                if table.contains_key(&key) {
                    return table.get_mut(&key);
                }
            }
            None
        }

        match stanza {
            Stanza::Iq(iq) => select(&mut self.iq, iq.type_, payload),
            Stanza::Message(message) => select(&mut self.message, message.type_, payload),
            Stanza::Presence(presence) => select(&mut self.presence, presence.type_, payload),
        }
        .or(self.fallback.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::jid::Jid;
    use crate::ns;
    use crate::stanza::{Message, Presence};

    struct Nop;

    impl Handler for Nop {
        fn handle_xmpp<'a>(
            &'a mut self,
            _rw: &'a mut TokenReadWriter<'_>,
        ) -> BoxFuture<'a, Result<(), Error>> {
            async { Ok(()) }.boxed()
        }
    }

    fn iq(type_: IqType) -> Stanza {
        Stanza::Iq(Iq::new(type_, "1"))
    }

    fn ping_payload() -> Payload {
        Some((ns::PING.to_owned(), "ping".to_owned()))
    }

    #[test]
    fn exact_match_wins() {
        let mut mux = ServeMux::new().iq(Some(IqType::Get), Some((ns::PING, "ping")), Nop);
        assert!(mux.lookup(&iq(IqType::Get), &ping_payload()).is_some());
        assert!(mux.lookup(&iq(IqType::Set), &ping_payload()).is_none());
        assert!(mux.lookup(&iq(IqType::Get), &None).is_none());
    }

    #[test]
    fn type_wildcard_catches_all_types() {
        let mut mux = ServeMux::new().iq(None, Some((ns::PING, "ping")), Nop);
        assert!(mux.lookup(&iq(IqType::Get), &ping_payload()).is_some());
        assert!(mux.lookup(&iq(IqType::Set), &ping_payload()).is_some());
        assert!(mux
            .lookup(&iq(IqType::Get), &Some(("urn:other".to_owned(), "x".to_owned())))
            .is_none());
    }

    #[test]
    fn payload_wildcard_catches_all_payloads() {
        let mut mux = ServeMux::new().iq(Some(IqType::Get), None, Nop);
        assert!(mux.lookup(&iq(IqType::Get), &ping_payload()).is_some());
        assert!(mux.lookup(&iq(IqType::Get), &None).is_some());
        assert!(mux.lookup(&iq(IqType::Set), &ping_payload()).is_none());
    }

    #[test]
    fn fallback_catches_everything_last() {
        let mut mux = ServeMux::new().fallback(Nop);
        assert!(mux.lookup(&iq(IqType::Get), &None).is_some());
        assert!(mux
            .lookup(&Stanza::Message(Message::default()), &None)
            .is_some());
        assert!(mux
            .lookup(&Stanza::Presence(Presence::default()), &None)
            .is_some());
    }

    #[test]
    fn kinds_route_independently() {
        let jid: Jid = "test@example.net".parse().unwrap();
        let mut mux =
            ServeMux::new().message(None, Some((ns::RECEIPTS, "received")), Nop);
        let message = Stanza::Message(Message {
            to: Some(jid),
            ..Message::default()
        });
        let payload = Some((ns::RECEIPTS.to_owned(), "received".to_owned()));
        assert!(mux.lookup(&message, &payload).is_some());
        assert!(mux.lookup(&iq(IqType::Get), &payload).is_none());
    }
}

impl Handler for ServeMux {
    fn handle_xmpp<'a>(
        &'a mut self,
        rw: &'a mut TokenReadWriter<'_>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let stanza = rw.stanza().clone();

            // Peek at the first payload child to select the route, then
            // push it back so the handler sees the full payload.
            let payload = loop {
                match rw.token().await? {
                    None => break None,
                    Some(ev @ Event::StartElement(_, _, _)) => {
                        let key = match &ev {
                            Event::StartElement(_, qname, _) => {
                                (qname.0.to_string(), qname.1.to_string())
                            }
                            _ => unreachable!(),
                        };
                        rw.unget(ev);
                        break Some(key);
                    }
                    Some(_) => continue,
                }
            };
            match self.lookup(&stanza, &payload) {
                Some(handler) => handler.handle_xmpp(rw).await,
                None => {
                    if let Stanza::Iq(iq) = &stanza {
                        if iq.type_.is_request() {
                            let reply = Iq {
                                id: iq.id.clone(),
                                to: iq.from.clone(),
                                from: None,
                                lang: None,
                                type_: IqType::Error,
                            };
                            let error =
                                StanzaError::service_unavailable().to_items(rw.content_ns());
                            let items = stanza::wrap_iq(rw.content_ns(), &reply, error);
                            rw.send(items).await?;
                        }
                    }
                    Ok(())
                }
            }
        }
        .boxed()
    }
}
