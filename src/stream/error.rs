//! Stream-level errors as specified in RFC 6120 §4.9.
//!
//! Stream errors are terminal: whichever side detects one writes it,
//! closes the stream, and the session ends.

use core::fmt;

use xso::{AsXml, FromXml};

use crate::ns;

/// Enumeration of the stream error conditions defined in RFC 6120 §4.9.3.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::STREAMS)]
pub enum DefinedCondition {
    /// The entity has sent XML that cannot be processed.
    #[xml(name = "bad-format")]
    BadFormat,

    /// The entity has sent a namespace prefix that is unsupported, or has
    /// sent no namespace prefix on an element that needs one.
    #[xml(name = "bad-namespace-prefix")]
    BadNamespacePrefix,

    /// The stream conflicts with another stream for the same entity.
    #[xml(name = "conflict")]
    Conflict,

    /// The peer has not responded to data sent over the stream.
    #[xml(name = "connection-timeout")]
    ConnectionTimeout,

    /// The `to` address names an FQDN no longer serviced by this entity.
    #[xml(name = "host-gone")]
    HostGone,

    /// The `to` address names an FQDN not serviced by this entity.
    #[xml(name = "host-unknown")]
    HostUnknown,

    /// A stanza lacks a `to` or `from` attribute, or the value violates the
    /// rules for XMPP addresses.
    #[xml(name = "improper-addressing")]
    ImproperAddressing,

    /// A misconfiguration or other internal error prevents servicing the
    /// stream.
    #[xml(name = "internal-server-error")]
    InternalServerError,

    /// The `from` attribute does not match an authorized JID.
    #[xml(name = "invalid-from")]
    InvalidFrom,

    /// The stream namespace is not `http://etherx.jabber.org/streams`, or
    /// the declared content namespace is unsupported.
    #[xml(name = "invalid-namespace")]
    InvalidNamespace,

    /// The entity has sent invalid XML to an entity which validates.
    #[xml(name = "invalid-xml")]
    InvalidXml,

    /// The entity attempted an action before the stream was authorized for
    /// it.
    #[xml(name = "not-authorized")]
    NotAuthorized,

    /// The entity has sent XML violating the well-formedness rules.
    #[xml(name = "not-well-formed")]
    NotWellFormed,

    /// The entity has violated a local service policy.
    #[xml(name = "policy-violation")]
    PolicyViolation,

    /// A remote entity needed for authentication or authorization could not
    /// be reached.
    #[xml(name = "remote-connection-failed")]
    RemoteConnectionFailed,

    /// The stream (and its security context) must be re-established.
    #[xml(name = "reset")]
    Reset,

    /// The server lacks the system resources to service the stream.
    #[xml(name = "resource-constraint")]
    ResourceConstraint,

    /// The entity has sent restricted XML features such as a comment,
    /// processing instruction, DTD subset, or entity reference.
    #[xml(name = "restricted-xml")]
    RestrictedXml,

    /// The server is redirecting the stream to another host. The text is
    /// the target, a domainpart optionally followed by `:port`.
    #[xml(name = "see-other-host")]
    SeeOtherHost(#[xml(text)] String),

    /// The server is being shut down.
    #[xml(name = "system-shutdown")]
    SystemShutdown,

    /// A condition not covered by the other conditions in this list.
    #[xml(name = "undefined-condition")]
    UndefinedCondition,

    /// The stream encoding is not supported or is improperly applied.
    #[xml(name = "unsupported-encoding")]
    UnsupportedEncoding,

    /// A mandatory-to-negotiate feature is not supported by the initiator
    /// and no supported alternative was offered.
    #[xml(name = "unsupported-feature")]
    UnsupportedFeature,

    /// A first-level child of the stream is not understood.
    #[xml(name = "unsupported-stanza-type")]
    UnsupportedStanzaType,

    /// The `version` attribute names an unsupported version of XMPP.
    #[xml(name = "unsupported-version")]
    UnsupportedVersion,
}

impl fmt::Display for DefinedCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::BadFormat => "bad-format",
            Self::BadNamespacePrefix => "bad-namespace-prefix",
            Self::Conflict => "conflict",
            Self::ConnectionTimeout => "connection-timeout",
            Self::HostGone => "host-gone",
            Self::HostUnknown => "host-unknown",
            Self::ImproperAddressing => "improper-addressing",
            Self::InternalServerError => "internal-server-error",
            Self::InvalidFrom => "invalid-from",
            Self::InvalidNamespace => "invalid-namespace",
            Self::InvalidXml => "invalid-xml",
            Self::NotAuthorized => "not-authorized",
            Self::NotWellFormed => "not-well-formed",
            Self::PolicyViolation => "policy-violation",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::Reset => "reset",
            Self::ResourceConstraint => "resource-constraint",
            Self::RestrictedXml => "restricted-xml",
            Self::SeeOtherHost(host) => return write!(f, "see-other-host: {}", host),
            Self::SystemShutdown => "system-shutdown",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnsupportedEncoding => "unsupported-encoding",
            Self::UnsupportedFeature => "unsupported-feature",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
        };
        f.write_str(s)
    }
}

/// Optional descriptive text inside a stream error.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::STREAMS, name = "text")]
pub struct Text {
    /// The language of the descriptive text.
    #[xml(attribute(name = "xml:lang", default))]
    pub lang: Option<String>,

    /// The text itself.
    #[xml(text)]
    pub text: String,
}

/// A `<stream:error/>` element.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::STREAM, name = "error")]
pub struct StreamError {
    /// The defined condition which triggered this stream error.
    #[xml(child)]
    pub condition: DefinedCondition,

    /// Optional descriptive text.
    #[xml(child(default))]
    pub text: Option<Text>,
}

impl StreamError {
    /// Constructs a stream error carrying just a condition.
    pub fn new(condition: DefinedCondition) -> StreamError {
        StreamError {
            condition,
            text: None,
        }
    }
}

impl From<DefinedCondition> for StreamError {
    fn from(condition: DefinedCondition) -> StreamError {
        StreamError::new(condition)
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.condition, f)?;
        if let Some(ref text) = self.text {
            write!(f, " ({:?})", text.text)?;
        }
        Ok(())
    }
}

impl std::error::Error for StreamError {}
