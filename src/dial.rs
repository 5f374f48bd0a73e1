//! Connection establishment.
//!
//! [`dial`] locates the peer for an address via DNS SRV
//! (`_xmpp-client._tcp` or `_xmpp-server._tcp`), trying the records in
//! priority and weight order, and falls back to the bare domain with the
//! scheme's default port when SRV resolution yields nothing. The returned
//! stream is handed to [`Session::negotiate`][`crate::Session::negotiate`].

use std::net::SocketAddr;

use futures::future::select_ok;
use futures::FutureExt;
use hickory_resolver::{IntoName, TokioAsyncResolver};
use log::debug;
use tokio::net::TcpStream;

use crate::error::Error;
use crate::jid::Jid;
use crate::session::Peer;

/// Connects to the server responsible for `addr` on the named network.
pub async fn dial(network: Peer, addr: &Jid) -> Result<TcpStream, Error> {
    let domain = strip_brackets(addr.domainpart());
    let fallback_port = network.default_port();

    // An IP literal needs no resolution at all.
    if let Ok(ip) = domain.parse() {
        debug!("attempting connection to {}:{}", ip, fallback_port);
        return Ok(TcpStream::connect(&SocketAddr::new(ip, fallback_port)).await?);
    }

    let ascii_domain = idna::domain_to_ascii(domain)?;
    let resolver = TokioAsyncResolver::tokio_from_system_conf()?;

    let srv_domain = format!("_{}._tcp.{}.", network.srv_service(), ascii_domain).into_name()?;
    let srv_records = resolver.srv_lookup(srv_domain.clone()).await.ok();

    match srv_records {
        Some(lookup) => {
            let mut records: Vec<_> = lookup.iter().collect();
            records.sort_by_key(|srv| (srv.priority(), core::cmp::Reverse(srv.weight())));
            for srv in records {
                debug!("attempting connection to {} {}", srv_domain, srv);
                match connect(&resolver, &srv.target().to_ascii(), srv.port()).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => debug!("connection attempt failed: {}", e),
                }
            }
            Err(Error::Disconnected)
        }
        None => {
            // SRV lookup failed; retry with the domain and default port.
            debug!(
                "attempting connection to {}:{}",
                ascii_domain, fallback_port
            );
            connect(&resolver, &ascii_domain, fallback_port).await
        }
    }
}

fn strip_brackets(domain: &str) -> &str {
    domain
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(domain)
}

async fn connect(
    resolver: &TokioAsyncResolver,
    host: &str,
    port: u16,
) -> Result<TcpStream, Error> {
    if let Ok(ip) = host.trim_end_matches('.').parse() {
        return Ok(TcpStream::connect(&SocketAddr::new(ip, port)).await?);
    }

    let ips = resolver.lookup_ip(host).await?;

    // Connect to all records in parallel; the first to succeed wins.
    select_ok(
        ips.into_iter()
            .map(|ip| TcpStream::connect(SocketAddr::new(ip, port)).boxed()),
    )
    .await
    .map(|(stream, _)| stream)
    .map_err(|_| Error::Disconnected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracketed_ip_literals_are_unwrapped() {
        assert_eq!(strip_brackets("[::1]"), "::1");
        assert_eq!(strip_brackets("example.net"), "example.net");
    }
}
