//! Namespace constants used throughout the crate.

/// `http://etherx.jabber.org/streams`, the namespace of the stream root
/// element and of `<stream:features/>` and `<stream:error/>`.
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// `jabber:client`, the default namespace of client-to-server streams.
pub const CLIENT: &str = "jabber:client";

/// `jabber:server`, the default namespace of server-to-server streams.
pub const SERVER: &str = "jabber:server";

/// `urn:ietf:params:xml:ns:xmpp-streams`, the namespace of stream error
/// conditions.
pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// `urn:ietf:params:xml:ns:xmpp-tls`, the STARTTLS feature namespace.
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// `urn:ietf:params:xml:ns:xmpp-sasl`, the SASL feature namespace.
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// `urn:ietf:params:xml:ns:xmpp-bind`, the resource binding namespace.
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// `urn:ietf:params:xml:ns:xmpp-stanzas`, the namespace of stanza error
/// conditions.
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// `urn:xmpp:ping`, the XEP-0199 ping namespace.
pub const PING: &str = "urn:xmpp:ping";

/// `urn:xmpp:receipts`, the XEP-0184 delivery receipts namespace.
pub const RECEIPTS: &str = "urn:xmpp:receipts";

/// `http://www.w3.org/XML/1998/namespace`, the `xml:` prefix namespace.
pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
