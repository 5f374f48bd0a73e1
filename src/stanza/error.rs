//! Stanza errors as specified in RFC 6120 §8.3.
//!
//! Unlike stream errors these are never terminal; they travel inside an
//! `iq` of type `error` (or a message/presence of type `error`) and the
//! stream continues.

use core::fmt;

use rxml::xml_ncname;
use xso::{AsXml, FromXml};

use crate::ns;
use crate::xmlstream::{wrap, Head, ItemResult};

/// How the erroring condition should be acted upon, RFC 6120 §8.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Retry after providing credentials.
    Auth,
    /// Do not retry; the error cannot be remedied.
    Cancel,
    /// Proceed; the condition was only a warning.
    Continue,
    /// Retry after changing the data sent.
    Modify,
    /// Retry after waiting; the error is temporary.
    Wait,
}

impl ErrorType {
    /// The wire representation of this error type.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enumeration of the stanza error conditions defined in RFC 6120 §8.3.3.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::STANZAS)]
pub enum DefinedCondition {
    /// The sender has sent a stanza containing XML that does not conform to
    /// the appropriate schema or that cannot be processed.
    #[xml(name = "bad-request")]
    BadRequest,

    /// Access cannot be granted because an existing resource exists with
    /// the same name or address.
    #[xml(name = "conflict")]
    Conflict,

    /// The feature represented in the XML stanza is not implemented by the
    /// intended recipient or an intermediate server.
    #[xml(name = "feature-not-implemented")]
    FeatureNotImplemented,

    /// The requesting entity does not possess the necessary permissions.
    #[xml(name = "forbidden")]
    Forbidden,

    /// The recipient or server can no longer be contacted at this address.
    /// The text optionally names the new address.
    #[xml(name = "gone")]
    Gone(#[xml(text)] String),

    /// The server has experienced a misconfiguration or other internal
    /// error.
    #[xml(name = "internal-server-error")]
    InternalServerError,

    /// The addressed JID or item requested cannot be found.
    #[xml(name = "item-not-found")]
    ItemNotFound,

    /// An address provided in the stanza does not adhere to the JID syntax.
    #[xml(name = "jid-malformed")]
    JidMalformed,

    /// The recipient understands the request but refuses to process it
    /// because it does not meet criteria it has defined.
    #[xml(name = "not-acceptable")]
    NotAcceptable,

    /// The recipient does not allow any entity to perform the action.
    #[xml(name = "not-allowed")]
    NotAllowed,

    /// The sender needs to provide proper credentials.
    #[xml(name = "not-authorized")]
    NotAuthorized,

    /// The requesting entity violated some service policy.
    #[xml(name = "policy-violation")]
    PolicyViolation,

    /// The intended recipient is temporarily unavailable.
    #[xml(name = "recipient-unavailable")]
    RecipientUnavailable,

    /// The recipient or server is redirecting requests for this
    /// information to another entity, named in the text.
    #[xml(name = "redirect")]
    Redirect(#[xml(text)] String),

    /// The requesting entity is not authorized to access the requested
    /// service because prior registration is needed.
    #[xml(name = "registration-required")]
    RegistrationRequired,

    /// A remote server or service specified as part or all of the JID of
    /// the intended recipient does not exist or cannot be resolved.
    #[xml(name = "remote-server-not-found")]
    RemoteServerNotFound,

    /// A remote server could not be contacted within a reasonable amount
    /// of time.
    #[xml(name = "remote-server-timeout")]
    RemoteServerTimeout,

    /// The server or recipient lacks the system resources necessary to
    /// service the request.
    #[xml(name = "resource-constraint")]
    ResourceConstraint,

    /// The server or recipient does not currently provide the requested
    /// service.
    #[xml(name = "service-unavailable")]
    ServiceUnavailable,

    /// The requesting entity is not authorized to access the requested
    /// service because a prior subscription is needed.
    #[xml(name = "subscription-required")]
    SubscriptionRequired,

    /// The error condition is not one of those defined by the other
    /// conditions in this list.
    #[xml(name = "undefined-condition")]
    UndefinedCondition,

    /// The recipient understood the request but was not expecting it at
    /// this time.
    #[xml(name = "unexpected-request")]
    UnexpectedRequest,
}

/// A stanza `<error/>` element.
///
/// The element itself lives in the stream's content namespace, which is
/// only known at serialisation time; [`to_items`][`Self::to_items`]
/// therefore takes the namespace instead of implementing [`AsXml`].
#[derive(Debug, Clone, PartialEq)]
pub struct StanzaError {
    /// How the condition should be acted upon.
    pub type_: ErrorType,
    /// The defined condition.
    pub condition: DefinedCondition,
}

impl StanzaError {
    /// Constructs a stanza error.
    pub fn new(type_: ErrorType, condition: DefinedCondition) -> StanzaError {
        StanzaError { type_, condition }
    }

    /// The canonical reply to a request nobody handles.
    pub fn service_unavailable() -> StanzaError {
        StanzaError::new(ErrorType::Cancel, DefinedCondition::ServiceUnavailable)
    }

    /// Serialises this error as an `<error/>` element in the given stream
    /// content namespace.
    ///
    /// The returned items own their data, so they may be chained behind
    /// envelope items of any lifetime.
    pub fn to_items<'x>(
        &self,
        stream_ns: &'static str,
    ) -> impl Iterator<Item = ItemResult<'x>> + Send {
        let head = Head::new(stream_ns, xml_ncname!("error")).attr(
            xml_ncname!("type"),
            self.type_.as_str(),
        );
        let condition: Vec<ItemResult<'static>> = match self.condition.as_xml_iter() {
            Ok(iter) => iter.map(|item| item.map(xso::Item::into_owned)).collect(),
            Err(e) => vec![Err(e)],
        };
        wrap(
            head,
            condition.into_iter().map(|item| -> ItemResult<'x> { item }),
        )
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} ({})", self.condition, self.type_)
    }
}
