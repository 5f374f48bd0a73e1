//! Detailed error types.

use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

use hickory_resolver::error::ResolveError as DnsResolveError;
use hickory_resolver::proto::error::ProtoError as DnsProtoError;
use sasl::client::MechanismError as SaslMechanismError;
use sasl::server::MechanismError as SaslServerMechanismError;

use crate::jid;
use crate::sasl::DefinedCondition as SaslDefinedCondition;
use crate::stream::error::StreamError;

/// Top-level error type of the crate.
#[derive(Debug)]
pub enum Error {
    /// I/O error on the underlying transport.
    Io(IoError),
    /// Error parsing a Jabber-Id.
    Jid(jid::Error),
    /// Protocol-level error.
    Protocol(ProtocolError),
    /// Authentication error.
    Auth(AuthError),
    /// Stream error received from the peer. Terminal for the stream.
    ReceivedStream(StreamError),
    /// Stream error detected locally and reported to the peer. Terminal for
    /// the stream.
    SentStream(StreamError),
    /// Connection closed.
    Disconnected,
    /// The XML input stream has been closed.
    InputStreamClosed,
    /// The XML output stream has been closed.
    OutputStreamClosed,
    /// DNS protocol error.
    Dns(DnsProtoError),
    /// DNS resolution error.
    Resolve(DnsResolveError),
    /// DNS label conversion error, no details available from module `idna`.
    Idna,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Jid(e) => write!(f, "jid parse error: {}", e),
            Error::Protocol(e) => write!(f, "protocol error: {}", e),
            Error::Auth(e) => write!(f, "authentication error: {}", e),
            Error::ReceivedStream(e) => write!(f, "received stream error: {}", e),
            Error::SentStream(e) => write!(f, "sent stream error: {}", e),
            Error::Disconnected => write!(f, "disconnected"),
            Error::InputStreamClosed => write!(f, "the XML input stream is closed"),
            Error::OutputStreamClosed => write!(f, "the XML output stream is closed"),
            Error::Dns(e) => write!(f, "{:?}", e),
            Error::Resolve(e) => write!(f, "{:?}", e),
            Error::Idna => write!(f, "IDNA error"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Jid(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Auth(e) => Some(e),
            _ => None,
        }
    }
}

impl Error {
    /// Whether this error is the normal quiescent termination of a stream:
    /// the peer closed its side of the connection between stanzas.
    pub(crate) fn is_eof(e: &IoError) -> bool {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => true,
            _ => e
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<rxml::Error>())
                .map(|inner| matches!(inner, rxml::Error::InvalidEof(_)))
                .unwrap_or(false),
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::Jid(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<xso::error::Error> for Error {
    fn from(e: xso::error::Error) -> Self {
        ProtocolError::Parse(e).into()
    }
}

impl From<DnsResolveError> for Error {
    fn from(e: DnsResolveError) -> Self {
        Error::Resolve(e)
    }
}

impl From<DnsProtoError> for Error {
    fn from(e: DnsProtoError) -> Self {
        Error::Dns(e)
    }
}

impl From<idna::Errors> for Error {
    fn from(_e: idna::Errors) -> Self {
        Error::Idna
    }
}

/// XMPP protocol-level error.
#[derive(Debug)]
pub enum ProtocolError {
    /// Error with the expected schema of a stream element.
    Parse(xso::error::Error),
    /// Encountered an unexpected XML token.
    InvalidToken,
    /// A token stream did not begin with a start element.
    NotStart,
    /// No `id` attribute in the responder's `<stream:stream>` header.
    NoStreamId,
    /// An `iq` with the same `id` is already awaiting its response.
    IqIdInFlight(String),
    /// Invalid response to resource binding.
    InvalidBindResponse,
    /// STARTTLS was selected but no TLS configuration is available for this
    /// role.
    TlsNotConfigured,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parse(e) => write!(f, "error with expected element schema: {}", e),
            ProtocolError::InvalidToken => write!(f, "encountered an unexpected XML token"),
            ProtocolError::NotStart => write!(f, "token stream did not begin with a start element"),
            ProtocolError::NoStreamId => write!(f, "no id attribute in <stream:stream>"),
            ProtocolError::IqIdInFlight(id) => {
                write!(f, "an iq with id {:?} is already in flight", id)
            }
            ProtocolError::InvalidBindResponse => {
                write!(f, "invalid response to resource binding")
            }
            ProtocolError::TlsNotConfigured => write!(f, "no TLS configuration available"),
        }
    }
}

impl StdError for ProtocolError {}

impl From<xso::error::Error> for ProtocolError {
    fn from(e: xso::error::Error) -> Self {
        ProtocolError::Parse(e)
    }
}

/// Authentication error.
#[derive(Debug)]
pub enum AuthError {
    /// No matching SASL mechanism available.
    NoMechanism,
    /// Local SASL implementation error.
    Sasl(SaslMechanismError),
    /// Server-side SASL implementation error.
    ServerSasl(SaslServerMechanismError),
    /// `<failure/>` from the authenticating server.
    Fail(SaslDefinedCondition),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(f, "no matching SASL mechanism available"),
            AuthError::Sasl(e) => write!(f, "local SASL implementation error: {}", e),
            AuthError::ServerSasl(e) => write!(f, "server SASL implementation error: {}", e),
            AuthError::Fail(c) => write!(f, "failure from the server: {}", c),
        }
    }
}

impl StdError for AuthError {}

impl From<SaslMechanismError> for AuthError {
    fn from(e: SaslMechanismError) -> Self {
        AuthError::Sasl(e)
    }
}

impl From<SaslServerMechanismError> for AuthError {
    fn from(e: SaslServerMechanismError) -> Self {
        AuthError::ServerSasl(e)
    }
}
