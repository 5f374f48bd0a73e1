use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rxml::{xml_ncname, Event, Namespace};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use xso::Item;

use super::*;
use crate::bind::BindResource;
use crate::mux::ServeMux;
use crate::negotiate::{FeatureName, Negotiated, Restart};
use crate::ping;
use crate::receipts;
use crate::stanza::{Iq, Message, Stanza};
use crate::xmlstream::{empty, wrap, Head};

const STREAM_OPEN: &str = "<stream:stream xmlns='jabber:client' \
     xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";

fn new_session(state: SessionState, io: DuplexStream) -> Session {
    Session::over(
        state,
        Box::new(io),
        "test@example.net".parse().unwrap(),
        "example.net".parse().unwrap(),
        ns::CLIENT,
    )
}

/// A session whose peer has already opened the stream; the header event
/// has been consumed so the next token is the first stanza.
async fn opened_session(state: SessionState) -> (Arc<Session>, DuplexStream) {
    let (lhs, mut rhs) = tokio::io::duplex(65536);
    let session = Arc::new(new_session(state, lhs));
    rhs.write_all(STREAM_OPEN.as_bytes()).await.unwrap();
    match session.token().await {
        Ok(Some(Event::StartElement(_, name, _))) => assert_eq!(name.1, "stream"),
        other => panic!("unexpected first token: {:?}", other),
    }
    (session, rhs)
}

async fn serve_case(
    input: &str,
    mut handler: Option<HandlerFunc>,
) -> (Result<(), Error>, String) {
    let (session, mut rhs) = opened_session(SessionState::EMPTY).await;
    rhs.write_all(input.as_bytes()).await.unwrap();
    rhs.shutdown().await.unwrap();

    let handler_ref: Option<&mut dyn Handler> = match handler.as_mut() {
        Some(h) => Some(h),
        None => None,
    };
    let result = session.serve(handler_ref).await;

    let mut out = Vec::new();
    rhs.read_to_end(&mut out).await.unwrap();
    (result, String::from_utf8(out).unwrap())
}

#[tokio::test]
async fn closed_input_stream() {
    for bits in 0..=0x3f_u8 {
        let state = SessionState::from_bits(bits);
        let (lhs, mut rhs) = tokio::io::duplex(4096);
        let session = new_session(state, lhs);
        rhs.shutdown().await.unwrap();

        let closed = state.contains(SessionState::INPUT_STREAM_CLOSED);
        match session.token().await {
            Err(Error::InputStreamClosed) => {
                assert!(closed, "unexpected closed-stream error for {:?}", state)
            }
            // With the bit clear, an empty transport is end-of-file, never
            // the closed-stream sentinel.
            Ok(None) | Err(Error::Io(_)) => {
                assert!(!closed, "expected the closed-stream error for {:?}", state)
            }
            other => panic!(
                "unexpected token result for {:?}: {:?}",
                state,
                other.map(|_| ())
            ),
        }
    }
}

#[tokio::test]
async fn closed_output_stream() {
    for bits in 0..=0x3f_u8 {
        let state = SessionState::from_bits(bits);
        let (lhs, _rhs) = tokio::io::duplex(4096);
        let session = new_session(state, lhs);
        let closed = state.contains(SessionState::OUTPUT_STREAM_CLOSED);

        let mut writer = session.token_writer().await;
        let item = Item::ElementHeadStart(
            Namespace::from(ns::CLIENT),
            std::borrow::Cow::Borrowed(xml_ncname!("a")),
        );
        match writer.write(&item) {
            Err(Error::OutputStreamClosed) => assert!(closed, "state {:?}", state),
            Ok(()) => assert!(!closed, "state {:?}", state),
            other => panic!("unexpected write result: {:?}", other),
        }
        match writer.flush().await {
            Err(Error::OutputStreamClosed) => assert!(closed, "state {:?}", state),
            Ok(()) => assert!(!closed, "state {:?}", state),
            other => panic!("unexpected flush result: {:?}", other),
        }
    }
}

#[tokio::test]
async fn serve_skips_unknown_elements() {
    let (result, out) = serve_case("<test></test>", None).await;
    result.expect("serve failed");
    assert_eq!(out, "</stream:stream>");
}

#[tokio::test]
async fn serve_reports_bad_format_on_stray_text() {
    let (result, out) = serve_case("a<test/>", None).await;
    match result {
        Err(Error::SentStream(e)) => assert_eq!(
            e.condition,
            crate::stream::error::DefinedCondition::BadFormat
        ),
        other => panic!("unexpected serve result: {:?}", other),
    }
    assert!(out.contains("bad-format"), "missing stream error: {}", out);
    assert!(out.ends_with("</stream:stream>"), "missing footer: {}", out);
}

const UNHANDLED_GET: &str =
    r#"<iq type="get" id="1234"><unknownpayload xmlns="unknown"/></iq>"#;

#[tokio::test]
async fn serve_answers_unhandled_iq_get() {
    let (result, out) = serve_case(UNHANDLED_GET, None).await;
    result.expect("serve failed");
    assert!(
        out.contains(r#"type="error""#) && out.contains(r#"id="1234""#),
        "missing error reply: {}",
        out
    );
    assert!(
        out.contains("service-unavailable"),
        "missing condition: {}",
        out
    );
    assert!(out.ends_with("</stream:stream>"), "missing footer: {}", out);
}

fn reply_result_1234<'a, 'b>(
    rw: &'a mut TokenReadWriter<'b>,
) -> BoxFuture<'a, Result<(), Error>> {
    async move {
        let iq = Iq::new(IqType::Result, "1234");
        rw.send(stanza::wrap_iq(rw.content_ns(), &iq, empty())).await
    }
    .boxed()
}

fn reply_result_wrongid<'a, 'b>(
    rw: &'a mut TokenReadWriter<'b>,
) -> BoxFuture<'a, Result<(), Error>> {
    async move {
        let iq = Iq::new(IqType::Result, "wrongid");
        rw.send(stanza::wrap_iq(rw.content_ns(), &iq, empty())).await
    }
    .boxed()
}

fn reply_error_1234<'a, 'b>(
    rw: &'a mut TokenReadWriter<'b>,
) -> BoxFuture<'a, Result<(), Error>> {
    async move {
        let iq = Iq::new(IqType::Error, "1234");
        rw.send(stanza::wrap_iq(rw.content_ns(), &iq, empty())).await
    }
    .boxed()
}

fn reply_get_1234<'a, 'b>(
    rw: &'a mut TokenReadWriter<'b>,
) -> BoxFuture<'a, Result<(), Error>> {
    async move {
        let iq = Iq::new(IqType::Get, "1234");
        rw.send(stanza::wrap_iq(rw.content_ns(), &iq, empty())).await
    }
    .boxed()
}

#[tokio::test]
async fn handler_reply_with_matching_id_suppresses_auto_error() {
    let (result, out) = serve_case(UNHANDLED_GET, Some(HandlerFunc(reply_result_1234))).await;
    result.expect("serve failed");
    assert!(
        out.contains(r#"type="result""#) && out.contains(r#"id="1234""#),
        "missing handler reply: {}",
        out
    );
    assert!(
        !out.contains("service-unavailable"),
        "unexpected auto reply: {}",
        out
    );
}

#[tokio::test]
async fn handler_reply_with_mismatched_id_gets_auto_error_too() {
    let (result, out) =
        serve_case(UNHANDLED_GET, Some(HandlerFunc(reply_result_wrongid))).await;
    result.expect("serve failed");
    assert!(
        out.contains(r#"id="wrongid""#),
        "missing handler reply: {}",
        out
    );
    assert!(
        out.contains("service-unavailable"),
        "missing auto reply: {}",
        out
    );
}

#[tokio::test]
async fn handler_error_reply_counts_as_a_reply() {
    let (result, out) = serve_case(UNHANDLED_GET, Some(HandlerFunc(reply_error_1234))).await;
    result.expect("serve failed");
    assert!(
        out.contains(r#"type="error""#) && out.contains(r#"id="1234""#),
        "missing handler reply: {}",
        out
    );
    assert!(
        !out.contains("service-unavailable"),
        "unexpected auto reply: {}",
        out
    );
}

#[tokio::test]
async fn handler_request_with_same_id_is_not_a_reply() {
    let (result, out) = serve_case(UNHANDLED_GET, Some(HandlerFunc(reply_get_1234))).await;
    result.expect("serve failed");
    assert!(
        out.contains(r#"type="get""#),
        "missing handler output: {}",
        out
    );
    assert!(
        out.contains("service-unavailable"),
        "missing auto reply: {}",
        out
    );
}

#[tokio::test]
async fn send_requires_a_start_element() {
    let (session, mut rhs) = opened_session(SessionState::EMPTY).await;
    match session.send(core::iter::once(Ok(Item::ElementFoot))).await {
        Err(Error::Protocol(ProtocolError::NotStart)) => (),
        other => panic!("unexpected send result: {:?}", other),
    }
    drop(session);
    let mut out = Vec::new();
    rhs.read_to_end(&mut out).await.unwrap();
    assert!(out.is_empty(), "bytes were written: {:?}", out);
}

#[tokio::test]
async fn iq_request_gets_its_response() {
    let (session, mut rhs) = opened_session(SessionState::EMPTY).await;

    rhs.write_all(br#"<iq type='result' id='123'/>"#)
        .await
        .unwrap();

    let server = Arc::clone(&session);
    let serve = tokio::spawn(async move { server.serve(None).await });

    let iq = Iq::new(IqType::Get, "123");
    let mut response = session
        .send_iq(iq, empty())
        .await
        .expect("send_iq failed")
        .expect("expected a response handle");

    match response.stanza() {
        Stanza::Iq(iq) => {
            assert_eq!(iq.type_, IqType::Result);
            assert_eq!(iq.id, "123");
        }
        other => panic!("unexpected response stanza: {:?}", other),
    }
    match response.token().await.unwrap() {
        Some(Event::StartElement(_, name, _)) => assert_eq!(name.1, "iq"),
        other => panic!("unexpected response token: {:?}", other),
    }
    while response.token().await.unwrap().is_some() {}

    rhs.shutdown().await.unwrap();
    serve.await.unwrap().expect("serve failed");

    let mut out = Vec::new();
    rhs.read_to_end(&mut out).await.unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(
        out.contains(r#"type="get""#) && out.contains(r#"id="123""#),
        "request not written: {}",
        out
    );
}

#[tokio::test]
async fn iq_responses_do_not_interleave() {
    let (session, mut rhs) = opened_session(SessionState::EMPTY).await;

    let server = Arc::clone(&session);
    let serve = tokio::spawn(async move { server.serve(None).await });

    let session_a = Arc::clone(&session);
    let task_a = tokio::spawn(async move {
        let mut response = session_a
            .send_iq(Iq::new(IqType::Get, "a"), empty())
            .await
            .unwrap()
            .unwrap();
        let mut children = Vec::new();
        while let Some(ev) = response.token().await.unwrap() {
            if let Event::StartElement(_, name, _) = ev {
                children.push(name.1.to_string());
            }
        }
        children
    });
    let session_b = Arc::clone(&session);
    let task_b = tokio::spawn(async move {
        let mut response = session_b
            .send_iq(Iq::new(IqType::Set, "b"), empty())
            .await
            .unwrap()
            .unwrap();
        let mut children = Vec::new();
        while let Some(ev) = response.token().await.unwrap() {
            if let Event::StartElement(_, name, _) = ev {
                children.push(name.1.to_string());
            }
        }
        children
    });

    // Let both requests hit the wire before answering them.
    tokio::time::sleep(Duration::from_millis(50)).await;
    rhs.write_all(
        [
            br#"<iq type='result' id='a'><apple xmlns='urn:example:a'/></iq>"#.as_slice(),
            br#"<iq type='result' id='b'><banana xmlns='urn:example:b'/></iq>"#.as_slice(),
        ]
        .concat()
        .as_slice(),
    )
    .await
    .unwrap();

    let children_a = task_a.await.unwrap();
    let children_b = task_b.await.unwrap();
    assert_eq!(children_a, vec!["iq".to_owned(), "apple".to_owned()]);
    assert_eq!(children_b, vec!["iq".to_owned(), "banana".to_owned()]);

    rhs.shutdown().await.unwrap();
    serve.await.unwrap().expect("serve failed");
}

#[tokio::test]
async fn duplicate_iq_ids_are_refused() {
    let (session, _rhs) = opened_session(SessionState::EMPTY).await;

    let first = Arc::clone(&session);
    let in_flight = tokio::spawn(async move {
        let _ = first.send_iq(Iq::new(IqType::Get, "dup"), empty()).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    match session.send_iq(Iq::new(IqType::Get, "dup"), empty()).await {
        Err(Error::Protocol(ProtocolError::IqIdInFlight(id))) => assert_eq!(id, "dup"),
        other => panic!("unexpected send_iq result: {:?}", other.map(|_| ())),
    }

    // Cancelling the in-flight request deregisters its waiter.
    in_flight.abort();
    let _ = in_flight.await;
    assert!(session.pending.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unpolled_send_iq_writes_nothing() {
    let (session, mut rhs) = opened_session(SessionState::EMPTY).await;
    {
        let fut = session.send_iq(Iq::new(IqType::Get, "zzz"), empty());
        drop(fut);
    }
    assert!(session.pending.lock().unwrap().is_empty());
    drop(session);
    let mut out = Vec::new();
    rhs.read_to_end(&mut out).await.unwrap();
    assert!(out.is_empty(), "bytes were written: {:?}", out);
}

#[tokio::test]
async fn result_iqs_are_plain_sends() {
    let (session, mut rhs) = opened_session(SessionState::EMPTY).await;
    let outcome = session
        .send_iq(Iq::new(IqType::Result, "123"), empty())
        .await
        .expect("send_iq failed");
    assert!(outcome.is_none());
    drop(session);
    let mut out = Vec::new();
    rhs.read_to_end(&mut out).await.unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains(r#"type="result""#), "not written: {}", out);
}

#[tokio::test]
async fn close_is_idempotent() {
    let (session, mut rhs) = opened_session(SessionState::EMPTY).await;
    session.close().await.expect("close failed");
    session.close().await.expect("second close failed");
    assert!(session.state().contains(SessionState::INPUT_STREAM_CLOSED));
    assert!(session.state().contains(SessionState::OUTPUT_STREAM_CLOSED));

    let mut out = Vec::new();
    rhs.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"</stream:stream>");
}

/// Full client/server negotiation over an in-memory duplex, then ping and
/// delivery-receipt round trips through multiplexers on both sides.
#[tokio::test]
async fn end_to_end_session() {
    let (lhs, rhs) = tokio::io::duplex(65536);
    let client_jid: Jid = "mercutio@example.net".parse().unwrap();
    let server_jid: Jid = "example.net".parse().unwrap();

    let server_cfg = SessionConfig::client(server_jid);
    let server = tokio::spawn(async move { Session::accept(server_cfg, rhs).await });
    let client_cfg = SessionConfig::client(client_jid).lang("en");
    let client = Session::negotiate(client_cfg, lhs).await.expect("client");
    let server = server.await.unwrap().expect("server");

    assert!(client.state().contains(SessionState::READY));
    assert!(server.state().contains(SessionState::READY));

    let client = Arc::new(client);
    let server = Arc::new(server);

    let client_receipts = Arc::new(receipts::Handler::new());
    let server_receipts = Arc::new(receipts::Handler::new());

    let server_task = {
        let server = Arc::clone(&server);
        let handler = Arc::clone(&server_receipts);
        tokio::spawn(async move {
            let mut mux = ServeMux::new()
                .iq(
                    Some(IqType::Get),
                    Some((ns::PING, "ping")),
                    ping::Handler::default(),
                )
                .message(None, Some((ns::RECEIPTS, "request")), handler);
            server.serve(Some(&mut mux)).await
        })
    };
    let client_task = {
        let client = Arc::clone(&client);
        let handler = Arc::clone(&client_receipts);
        tokio::spawn(async move {
            let mut mux =
                ServeMux::new().message(None, Some((ns::RECEIPTS, "received")), handler);
            client.serve(Some(&mut mux)).await
        })
    };

    // Ping round trip through the iq correlator.
    tokio::time::timeout(Duration::from_secs(5), ping::send(&client, None))
        .await
        .expect("ping timed out")
        .expect("ping failed");

    // Delivery receipt round trip through both multiplexers.
    let message = Message {
        to: Some(server.local().clone()),
        ..Message::default()
    };
    tokio::time::timeout(
        Duration::from_secs(5),
        client_receipts.send_message(&client, message),
    )
    .await
    .expect("receipt timed out")
    .expect("receipt failed");

    client.close().await.expect("client close");
    server_task.await.unwrap().expect("server serve");
    server.close().await.expect("server close");
    client_task.await.unwrap().expect("client serve");
}

/// A stand-in for a security-layer feature: it is advertised as required,
/// flips the given state bit on both sides and forces a stream restart,
/// without pulling real cryptography into the test.
struct Marker {
    ns: &'static str,
    mask: SessionState,
    necessary: SessionState,
}

impl crate::StreamFeature for Marker {
    fn name(&self) -> FeatureName {
        FeatureName {
            ns: self.ns,
            local: "m",
        }
    }

    fn necessary(&self) -> SessionState {
        self.necessary
    }

    fn prohibited(&self) -> SessionState {
        self.mask
    }

    fn list<'a>(
        &'a self,
        stream: &'a mut NegotiateStream,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            stream
                .send_items(wrap(Head::new(self.ns, xml_ncname!("m")), empty()))
                .await?;
            Ok(true)
        }
        .boxed()
    }

    fn parse<'a>(
        &'a self,
        stream: &'a mut NegotiateStream,
    ) -> BoxFuture<'a, Result<(bool, Option<crate::FeatureData>), Error>> {
        async move {
            match stream.next_event().await? {
                Some(Event::StartElement(_, _, _)) => (),
                other => panic!("unexpected advertisement: {:?}", other),
            }
            stream.skip_element().await?;
            Ok((true, None))
        }
        .boxed()
    }

    fn negotiate<'a>(
        &'a self,
        stream: &'a mut NegotiateStream,
        _data: Option<crate::FeatureData>,
    ) -> BoxFuture<'a, Result<Negotiated, Error>> {
        async move {
            if stream.state().contains(SessionState::RECEIVED) {
                match stream.next_event().await? {
                    Some(Event::StartElement(_, _, _)) => stream.skip_element().await?,
                    other => panic!("unexpected selection: {:?}", other),
                }
                stream
                    .send_items(wrap(Head::new(self.ns, xml_ncname!("m")), empty()))
                    .await?;
            } else {
                stream
                    .send_items(wrap(Head::new(self.ns, xml_ncname!("m")), empty()))
                    .await?;
                match stream.next_event().await? {
                    Some(Event::StartElement(_, _, _)) => stream.skip_element().await?,
                    other => panic!("unexpected confirmation: {:?}", other),
                }
            }
            Ok(Negotiated {
                mask: self.mask,
                restart: Restart::SameTransport,
                end_stream: false,
            })
        }
        .boxed()
    }
}

fn security_chain() -> (Marker, Marker) {
    let secure = Marker {
        ns: "urn:example:secure",
        mask: SessionState::SECURE,
        necessary: SessionState::EMPTY,
    };
    let auth = Marker {
        ns: "urn:example:auth",
        mask: SessionState::AUTHN,
        necessary: SessionState::SECURE,
    };
    (secure, auth)
}

/// A three-stage negotiation (security layer, authentication, binding)
/// with two stream restarts, ending in a server-assigned full JID.
#[tokio::test]
async fn chained_negotiation_binds_a_resource() {
    let (lhs, rhs) = tokio::io::duplex(65536);
    let client_jid: Jid = "mercutio@example.net".parse().unwrap();
    let server_jid: Jid = "example.net".parse().unwrap();

    let (secure, auth) = security_chain();
    let server_cfg = SessionConfig::client(server_jid)
        .feature(secure)
        .feature(auth)
        .feature(BindResource::new());
    let server = tokio::spawn(async move { Session::accept(server_cfg, rhs).await });

    let (secure, auth) = security_chain();
    let client_cfg = SessionConfig::client(client_jid)
        .feature(secure)
        .feature(auth)
        .feature(BindResource::new());
    let client = Session::negotiate(client_cfg, lhs).await.expect("client");
    let server = server.await.unwrap().expect("server");

    for session in [&client, &server] {
        assert!(session.state().contains(SessionState::SECURE));
        assert!(session.state().contains(SessionState::AUTHN));
        assert!(session.state().contains(SessionState::READY));
    }

    // The server assigned a resource against the client's bare identity,
    // and both sides agree on the resulting full JID.
    assert_eq!(
        client.local().bare().to_string(),
        "mercutio@example.net"
    );
    assert!(!client.local().is_bare());
    assert_eq!(client.local(), server.remote());
}

/// Initiator configured with STARTTLS against a scripted peer: the
/// feature is selected and the request hits the wire before the peer goes
/// away.
#[tokio::test]
async fn negotiator_writes_starttls_selection() {
    use std::sync::Arc as StdArc;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    let (lhs, mut rhs) = tokio::io::duplex(65536);
    let client_jid: Jid = "mercutio@example.net".parse().unwrap();

    let config = ClientConfig::builder()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    let connector = TlsConnector::from(StdArc::new(config));
    let cfg = SessionConfig::client(client_jid)
        .feature(crate::starttls::StartTls::client(true, connector));

    rhs.write_all(
        [
            br#"<stream:stream id='316732270768047465' version='1.0' xml:lang='en' xmlns:stream='http://etherx.jabber.org/streams' xmlns='jabber:client'>"#.as_slice(),
            br#"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>"#.as_slice(),
        ]
        .concat()
        .as_slice(),
    )
    .await
    .unwrap();
    rhs.shutdown().await.unwrap();

    match Session::negotiate(cfg, lhs).await {
        Ok(_) => panic!("negotiation unexpectedly succeeded"),
        Err(Error::Io(_)) | Err(Error::Disconnected) => (),
        Err(other) => panic!("unexpected error: {:?}", other),
    }

    let mut out = Vec::new();
    rhs.read_to_end(&mut out).await.unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("<stream:stream"), "missing header: {}", out);
    assert!(
        out.contains(r#"<starttls xmlns="urn:ietf:params:xml:ns:xmpp-tls""#),
        "missing starttls selection: {}",
        out
    );
}
