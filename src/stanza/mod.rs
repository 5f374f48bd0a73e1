//! Stanza envelopes and their lazy builders.
//!
//! The envelope types carry only the common attributes (`id`, `to`,
//! `from`, `xml:lang`, `type`); payloads stay token streams and are pulled
//! lazily while a stanza is serialised, so large payloads are never
//! buffered.

pub mod error;

use rxml::parser::EventMetrics;
use rxml::{xml_ncname, AttrMap, Event, Namespace, NcNameStr, QName};

use crate::jid::Jid;
use crate::xmlstream::{wrap, Head, ItemResult};

/// The three stanza kinds defined by RFC 6120.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Request/response exchanges (`<iq/>`).
    Iq,
    /// Push-style messaging (`<message/>`).
    Message,
    /// Network availability (`<presence/>`).
    Presence,
}

impl Kind {
    pub(crate) fn local_name(self) -> &'static NcNameStr {
        match self {
            Kind::Iq => xml_ncname!("iq"),
            Kind::Message => xml_ncname!("message"),
            Kind::Presence => xml_ncname!("presence"),
        }
    }
}

/// The type of an `iq` stanza. Always present on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IqType {
    /// A request for information.
    Get,
    /// A request that provides or replaces data.
    Set,
    /// The positive response to a `get` or `set`.
    Result,
    /// The negative response to a `get` or `set`.
    Error,
}

impl IqType {
    /// The wire representation of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    /// Whether this type requires a reply (`get` or `set`).
    pub fn is_request(self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }

    fn parse(s: &str) -> Option<IqType> {
        match s {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None,
        }
    }
}

/// The type of a `message` stanza. `normal` is the default and is elided
/// on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// A standalone message.
    #[default]
    Normal,
    /// A message in a one-to-one conversation.
    Chat,
    /// A message in a multi-user chat.
    Groupchat,
    /// An automated alert or broadcast.
    Headline,
    /// An error in response to a previously sent message.
    Error,
}

impl MessageType {
    /// The wire representation of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Normal => "normal",
            MessageType::Chat => "chat",
            MessageType::Groupchat => "groupchat",
            MessageType::Headline => "headline",
            MessageType::Error => "error",
        }
    }

    fn parse(s: &str) -> MessageType {
        match s {
            "chat" => MessageType::Chat,
            "groupchat" => MessageType::Groupchat,
            "headline" => MessageType::Headline,
            "error" => MessageType::Error,
            // RFC 6121 §5.2.2: an unrecognized type is treated as normal.
            _ => MessageType::Normal,
        }
    }
}

/// The type of a `presence` stanza. Availability is signalled by the
/// absence of the attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PresenceType {
    /// The entity is available for communication (empty type).
    #[default]
    Available,
    /// The entity is no longer available.
    Unavailable,
    /// A request to subscribe to the recipient's presence.
    Subscribe,
    /// The subscription request was granted.
    Subscribed,
    /// A request to unsubscribe from the recipient's presence.
    Unsubscribe,
    /// The subscription was denied or revoked.
    Unsubscribed,
    /// A server-generated request for an entity's current presence.
    Probe,
    /// An error in response to a previously sent presence.
    Error,
}

impl PresenceType {
    /// The wire representation of this type, empty for availability.
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceType::Available => "",
            PresenceType::Unavailable => "unavailable",
            PresenceType::Subscribe => "subscribe",
            PresenceType::Subscribed => "subscribed",
            PresenceType::Unsubscribe => "unsubscribe",
            PresenceType::Unsubscribed => "unsubscribed",
            PresenceType::Probe => "probe",
            PresenceType::Error => "error",
        }
    }

    fn parse(s: &str) -> PresenceType {
        match s {
            "unavailable" => PresenceType::Unavailable,
            "subscribe" => PresenceType::Subscribe,
            "subscribed" => PresenceType::Subscribed,
            "unsubscribe" => PresenceType::Unsubscribe,
            "unsubscribed" => PresenceType::Unsubscribed,
            "probe" => PresenceType::Probe,
            "error" => PresenceType::Error,
            _ => PresenceType::Available,
        }
    }
}

/// An `iq` ("Information Query") envelope.
///
/// IQs are one-to-one, provide get and set semantics, and always require a
/// response in the form of a result or an error.
#[derive(Debug, Clone, PartialEq)]
pub struct Iq {
    /// The stanza id. Required; [`Session::send_iq`][`crate::Session::send_iq`]
    /// generates one when this is empty.
    pub id: String,
    /// The intended recipient.
    pub to: Option<Jid>,
    /// The sender.
    pub from: Option<Jid>,
    /// The stanza language.
    pub lang: Option<String>,
    /// The iq type.
    pub type_: IqType,
}

impl Iq {
    /// Constructs an iq envelope with the given type and id.
    pub fn new(type_: IqType, id: impl Into<String>) -> Iq {
        Iq {
            id: id.into(),
            to: None,
            from: None,
            lang: None,
            type_,
        }
    }
}

/// A `message` envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// The stanza id.
    pub id: Option<String>,
    /// The intended recipient.
    pub to: Option<Jid>,
    /// The sender.
    pub from: Option<Jid>,
    /// The stanza language.
    pub lang: Option<String>,
    /// The message type.
    pub type_: MessageType,
}

/// A `presence` envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Presence {
    /// The stanza id.
    pub id: Option<String>,
    /// The intended recipient.
    pub to: Option<Jid>,
    /// The sender.
    pub from: Option<Jid>,
    /// The stanza language.
    pub lang: Option<String>,
    /// The presence type.
    pub type_: PresenceType,
}

fn jid_attr<'x>(head: Head<'x>, name: &'x NcNameStr, value: Option<&'x Jid>) -> Head<'x> {
    match value {
        Some(jid) => head.attr(name, jid.to_string()),
        None => head,
    }
}

/// Wraps a payload in an `iq` envelope in the given stream content
/// namespace. Attributes with default values are elided.
pub fn wrap_iq<'x, I>(ns: &'static str, iq: &'x Iq, payload: I) -> impl Iterator<Item = ItemResult<'x>> + Send
where
    I: Iterator<Item = ItemResult<'x>> + Send,
{
    let mut head =
        Head::new(ns, xml_ncname!("iq")).attr(xml_ncname!("type"), iq.type_.as_str());
    head = jid_attr(head, xml_ncname!("to"), iq.to.as_ref());
    head = jid_attr(head, xml_ncname!("from"), iq.from.as_ref());
    if let Some(ref lang) = iq.lang {
        head = head.lang(lang.as_str());
    }
    if !iq.id.is_empty() {
        head = head.attr(xml_ncname!("id"), iq.id.as_str());
    }
    wrap(head, payload)
}

/// Wraps a payload in a `message` envelope in the given stream content
/// namespace. A `normal` type is elided.
pub fn wrap_message<'x, I>(
    ns: &'static str,
    message: &'x Message,
    payload: I,
) -> impl Iterator<Item = ItemResult<'x>> + Send
where
    I: Iterator<Item = ItemResult<'x>> + Send,
{
    let mut head = Head::new(ns, xml_ncname!("message"));
    head = jid_attr(head, xml_ncname!("to"), message.to.as_ref());
    head = jid_attr(head, xml_ncname!("from"), message.from.as_ref());
    if let Some(ref id) = message.id {
        head = head.attr(xml_ncname!("id"), id.as_str());
    }
    if let Some(ref lang) = message.lang {
        head = head.lang(lang.as_str());
    }
    if message.type_ != MessageType::Normal {
        head = head.attr(xml_ncname!("type"), message.type_.as_str());
    }
    wrap(head, payload)
}

/// Wraps a payload in a `presence` envelope in the given stream content
/// namespace. The empty (available) type is elided.
pub fn wrap_presence<'x, I>(
    ns: &'static str,
    presence: &'x Presence,
    payload: I,
) -> impl Iterator<Item = ItemResult<'x>> + Send
where
    I: Iterator<Item = ItemResult<'x>> + Send,
{
    let mut head = Head::new(ns, xml_ncname!("presence"));
    head = jid_attr(head, xml_ncname!("to"), presence.to.as_ref());
    head = jid_attr(head, xml_ncname!("from"), presence.from.as_ref());
    if let Some(ref id) = presence.id {
        head = head.attr(xml_ncname!("id"), id.as_str());
    }
    if let Some(ref lang) = presence.lang {
        head = head.lang(lang.as_str());
    }
    if presence.type_ != PresenceType::Available {
        head = head.attr(xml_ncname!("type"), presence.type_.as_str());
    }
    wrap(head, payload)
}

/// A parsed stanza envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    /// An `iq` envelope.
    Iq(Iq),
    /// A `message` envelope.
    Message(Message),
    /// A `presence` envelope.
    Presence(Presence),
}

impl Stanza {
    /// The stanza kind.
    pub fn kind(&self) -> Kind {
        match self {
            Stanza::Iq(_) => Kind::Iq,
            Stanza::Message(_) => Kind::Message,
            Stanza::Presence(_) => Kind::Presence,
        }
    }

    /// The stanza id, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Iq(iq) => (!iq.id.is_empty()).then_some(iq.id.as_str()),
            Stanza::Message(m) => m.id.as_deref(),
            Stanza::Presence(p) => p.id.as_deref(),
        }
    }

    /// The sender address, if any.
    pub fn from_jid(&self) -> Option<&Jid> {
        match self {
            Stanza::Iq(iq) => iq.from.as_ref(),
            Stanza::Message(m) => m.from.as_ref(),
            Stanza::Presence(p) => p.from.as_ref(),
        }
    }

    /// The recipient address, if any.
    pub fn to_jid(&self) -> Option<&Jid> {
        match self {
            Stanza::Iq(iq) => iq.to.as_ref(),
            Stanza::Message(m) => m.to.as_ref(),
            Stanza::Presence(p) => p.to.as_ref(),
        }
    }

    /// Parses a stanza envelope from a stream-level start element.
    ///
    /// Returns `None` for elements that are not stanzas in the given
    /// content namespace; those are skipped by the serve loop. The common
    /// attributes are removed from `attrs`, leaving any extensions behind.
    pub(crate) fn parse(
        default_ns: &str,
        name: &QName,
        attrs: &mut AttrMap,
    ) -> Option<Stanza> {
        if name.0 != default_ns {
            return None;
        }

        let id = attrs.remove(Namespace::none(), "id");
        let type_ = attrs.remove(Namespace::none(), "type");
        let to = parse_addr_attr(attrs.remove(Namespace::none(), "to"));
        let from = parse_addr_attr(attrs.remove(Namespace::none(), "from"));
        let lang = attrs.remove(Namespace::xml(), "lang");

        if name.1 == "iq" {
            let type_ = IqType::parse(type_.as_deref().unwrap_or(""))?;
            Some(Stanza::Iq(Iq {
                id: id.unwrap_or_default(),
                to,
                from,
                lang,
                type_,
            }))
        } else if name.1 == "message" {
            Some(Stanza::Message(Message {
                id,
                to,
                from,
                lang,
                type_: MessageType::parse(type_.as_deref().unwrap_or("")),
            }))
        } else if name.1 == "presence" {
            Some(Stanza::Presence(Presence {
                id,
                to,
                from,
                lang,
                type_: PresenceType::parse(type_.as_deref().unwrap_or("")),
            }))
        } else {
            None
        }
    }

    /// Rebuilds the start element event for this envelope, reattaching any
    /// extension attributes that were left over from parsing.
    pub(crate) fn rebuild_start(&self, extra: AttrMap, ns: &'static str) -> Event {
        let mut attrs = AttrMap::new();
        let type_ = match self {
            Stanza::Iq(iq) => Some(iq.type_.as_str()),
            Stanza::Message(m) => (m.type_ != MessageType::Normal).then(|| m.type_.as_str()),
            Stanza::Presence(p) => {
                (p.type_ != PresenceType::Available).then(|| p.type_.as_str())
            }
        };
        if let Some(type_) = type_ {
            attrs.insert(
                Namespace::NONE,
                xml_ncname!("type").to_owned(),
                type_.to_owned(),
            );
        }
        if let Some(id) = self.id() {
            attrs.insert(Namespace::NONE, xml_ncname!("id").to_owned(), id.to_owned());
        }
        if let Some(to) = self.to_jid() {
            attrs.insert(Namespace::NONE, xml_ncname!("to").to_owned(), to.to_string());
        }
        if let Some(from) = self.from_jid() {
            attrs.insert(
                Namespace::NONE,
                xml_ncname!("from").to_owned(),
                from.to_string(),
            );
        }
        for ((attr_ns, attr_name), value) in extra.into_iter() {
            attrs.insert(attr_ns, attr_name, value);
        }
        Event::StartElement(
            EventMetrics::zero(),
            (Namespace::from(ns), self.kind().local_name().to_owned()),
            attrs,
        )
    }
}

fn parse_addr_attr(value: Option<String>) -> Option<Jid> {
    let value = value?;
    match value.parse() {
        Ok(jid) => Some(jid),
        Err(e) => {
            log::debug!("ignoring malformed stanza address {:?}: {}", value, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use xso::Item;

    use crate::ns;
    use crate::xmlstream::empty;

    fn render<'x>(items: impl Iterator<Item = ItemResult<'x>>) -> Vec<Item<'x>> {
        items.map(|item| item.unwrap()).collect()
    }

    fn attr_of<'x>(items: &'x [Item<'x>], name: &str) -> Option<&'x str> {
        items.iter().find_map(|item| match item {
            Item::Attribute(_, attr, value) if &**attr == name => Some(&**value),
            _ => None,
        })
    }

    #[test]
    fn iq_attributes_and_elision() {
        let iq = Iq::new(IqType::Result, "1234");
        let items = render(wrap_iq(ns::CLIENT, &iq, empty()));
        assert!(matches!(items.first(), Some(Item::ElementHeadStart(_, name)) if &**name == "iq"));
        assert_eq!(attr_of(&items, "type"), Some("result"));
        assert_eq!(attr_of(&items, "id"), Some("1234"));
        assert_eq!(attr_of(&items, "to"), None);
        assert!(matches!(items.last(), Some(Item::ElementFoot)));
    }

    #[test]
    fn normal_message_type_is_elided() {
        let to: Jid = "test@example.net".parse().unwrap();
        let message = Message {
            to: Some(to),
            ..Message::default()
        };
        let items = render(wrap_message(ns::CLIENT, &message, empty()));
        assert_eq!(attr_of(&items, "type"), None);
        assert_eq!(attr_of(&items, "to"), Some("test@example.net"));

        let message = Message {
            type_: MessageType::Chat,
            ..Message::default()
        };
        let items = render(wrap_message(ns::CLIENT, &message, empty()));
        assert_eq!(attr_of(&items, "type"), Some("chat"));
    }

    #[test]
    fn available_presence_type_is_elided() {
        let presence = Presence::default();
        let items = render(wrap_presence(ns::CLIENT, &presence, empty()));
        assert_eq!(attr_of(&items, "type"), None);

        let presence = Presence {
            type_: PresenceType::Unavailable,
            ..Presence::default()
        };
        let items = render(wrap_presence(ns::CLIENT, &presence, empty()));
        assert_eq!(attr_of(&items, "type"), Some("unavailable"));
    }

    #[test]
    fn payload_is_wrapped_between_head_and_foot() {
        let iq = Iq::new(IqType::Get, "42");
        let payload = vec![
            Ok(Item::ElementHeadStart(
                Namespace::from(ns::PING),
                std::borrow::Cow::Borrowed(xml_ncname!("ping")),
            )),
            Ok(Item::ElementFoot),
        ];
        let items = render(wrap_iq(ns::CLIENT, &iq, payload.into_iter()));
        let feet = items
            .iter()
            .filter(|item| matches!(item, Item::ElementFoot))
            .count();
        assert_eq!(feet, 2);
        assert!(matches!(items.last(), Some(Item::ElementFoot)));
    }

    #[test]
    fn parse_round_trip() {
        let mut attrs = AttrMap::new();
        attrs.insert(
            Namespace::NONE,
            xml_ncname!("type").to_owned(),
            "get".to_owned(),
        );
        attrs.insert(
            Namespace::NONE,
            xml_ncname!("id").to_owned(),
            "123".to_owned(),
        );
        attrs.insert(
            Namespace::NONE,
            xml_ncname!("from").to_owned(),
            "romeo@example.net/orchard".to_owned(),
        );
        let name = (
            Namespace::from(ns::CLIENT),
            xml_ncname!("iq").to_owned(),
        );

        let mut attrs_in = attrs;
        let stanza = Stanza::parse(ns::CLIENT, &name, &mut attrs_in).unwrap();
        assert_eq!(stanza.kind(), Kind::Iq);
        assert_eq!(stanza.id(), Some("123"));
        assert_eq!(
            stanza.from_jid().unwrap().to_string(),
            "romeo@example.net/orchard"
        );

        match stanza.rebuild_start(attrs_in, ns::CLIENT) {
            Event::StartElement(_, rebuilt_name, rebuilt_attrs) => {
                assert_eq!(rebuilt_name.1, name.1);
                let mut rebuilt = rebuilt_attrs;
                assert_eq!(
                    rebuilt.remove(Namespace::none(), "id").as_deref(),
                    Some("123")
                );
                assert_eq!(
                    rebuilt.remove(Namespace::none(), "type").as_deref(),
                    Some("get")
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn non_stanza_elements_are_rejected() {
        let mut attrs = AttrMap::new();
        let name = (
            Namespace::from(ns::CLIENT),
            xml_ncname!("unknown").to_owned(),
        );
        assert!(Stanza::parse(ns::CLIENT, &name, &mut attrs).is_none());

        let name = (Namespace::from(ns::TLS), xml_ncname!("iq").to_owned());
        assert!(Stanza::parse(ns::CLIENT, &name, &mut attrs).is_none());
    }
}
