//! An [XMPP](https://xmpp.org/) (RFC 6120/6122) session engine with
//! asynchronous I/O using [tokio](https://tokio.rs/).
//!
//! The crate implements the streamed-XML protocol state machine at the
//! heart of XMPP: it opens a long-lived bidirectional stream to a peer,
//! negotiates a pluggable set of stream features (TLS upgrade, SASL
//! authentication, resource binding), and then multiplexes stanzas over
//! the stream with request/response correlation for `iq`.
//!
//! # Getting started
//!
//! A client session is established by dialing the peer and negotiating
//! the stream:
//!
//! ```no_run
//! use tokio_jabber::{dial, ping, Jid, Session, SessionConfig, Peer};
//!
//! # async fn run() -> Result<(), tokio_jabber::Error> {
//! let jid: Jid = "mercutio@example.net".parse()?;
//! let conn = dial(Peer::Client, &jid).await?;
//! let session = Session::negotiate(SessionConfig::client(jid), conn).await?;
//!
//! // Dispatch inbound stanzas on one task…
//! // tokio::spawn(async move { session.serve(None).await });
//! // …and make requests from others.
//! ping::send(&session, None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The cryptographic building blocks are external collaborators: TLS
//! comes from `tokio-rustls`, SASL mechanisms from the `sasl` crate, and
//! the XML tokenizer is `rxml`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bind;
mod dial;
/// Detailed error types.
pub mod error;
pub mod jid;
pub mod mux;
mod negotiate;
pub mod ns;
pub mod ping;
pub mod receipts;
pub mod sasl;
mod session;
pub mod stanza;
pub mod starttls;
pub mod stream;
pub mod xmlstream;

pub use crate::dial::dial;
#[doc(inline)]
pub use crate::error::Error;
#[doc(inline)]
pub use crate::jid::Jid;
#[doc(inline)]
pub use crate::mux::ServeMux;
pub use crate::negotiate::{
    FeatureData, FeatureName, Negotiated, NegotiateStream, Restart, StreamFeature,
    TransportUpgrade,
};
pub use crate::session::{
    Handler, HandlerFunc, IqResponse, Peer, Session, SessionConfig, SessionState,
    TokenReadWriter, TokenWriter,
};

#[cfg(test)]
mod tests {
    #[test]
    fn reexports() {
        #[allow(unused_imports)]
        use crate::{Error, Handler, Jid, ServeMux, Session, SessionState};
    }
}
