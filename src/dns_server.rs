//! MagicDNS responder.
//!
//! A small DNS server built on
//! [hickory-dns](https://crates.io/crates/hickory-server) that answers for
//! overlay nodes straight from the coordinator's node directory:
//!
//! * **Node names**: bare given names and `<given>.<user>.<domain>` FQDNs
//!   resolve to the node's overlay addresses (A for IPv4, AAAA for IPv6).
//! * **Unknown names under the base domain** get NXDOMAIN.
//! * **Everything else** is forwarded to the system resolvers.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, ResponseCode};
use hickory_server::proto::rr::rdata::{A, AAAA};
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use hickory_server::server::{
    Request, RequestHandler, ResponseHandler, ResponseInfo, ServerFuture,
};
use log::{error, info, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Duration;

use crate::coordinator::Coordinator;

/// Timeout for idle TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// TTL of answers for overlay nodes. Kept short since nodes come and go.
const NODE_TTL: u32 = 5;

/// TTL of forwarded answers.
const UPSTREAM_TTL: u32 = 60;

/// Start the DNS server.
pub async fn run_dns_server(bind_addr: SocketAddr, coordinator: Arc<Coordinator>) -> anyhow::Result<()> {
    info!("DNS server starting on {}", bind_addr);

    let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
        error!(
            "Failed to load system resolv.conf: {}. Falling back to default upstreams.",
            e
        );
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    });

    let base_domain = coordinator_domain(&coordinator);
    let handler = NetmapDns {
        coordinator,
        resolver,
        base_domain,
    };
    let mut server = ServerFuture::new(handler);

    let udp = UdpSocket::bind(bind_addr).await?;
    server.register_socket(udp);

    let tcp = TcpListener::bind(bind_addr).await?;
    server.register_listener(tcp, TCP_TIMEOUT);

    server.block_until_done().await?;
    Ok(())
}

fn coordinator_domain(coordinator: &Coordinator) -> Option<String> {
    let dns = coordinator.dns_settings();
    (dns.magic_dns && !dns.base_domain.is_empty()).then(|| dns.base_domain.to_ascii_lowercase())
}

/// Records of `qtype` for `addrs`.
fn address_records(name: &Name, qtype: RecordType, ttl: u32, addrs: &[IpAddr]) -> Vec<Record> {
    addrs
        .iter()
        .filter_map(|addr| match (addr, qtype) {
            (IpAddr::V4(ipv4), RecordType::A | RecordType::ANY) => {
                Some(Record::from_rdata(name.clone(), ttl, RData::A(A(*ipv4))))
            }
            (IpAddr::V6(ipv6), RecordType::AAAA | RecordType::ANY) => {
                Some(Record::from_rdata(name.clone(), ttl, RData::AAAA(AAAA(*ipv6))))
            }
            _ => None,
        })
        .collect()
}

fn is_within(qname: &str, domain: &str) -> bool {
    let qname = qname.to_ascii_lowercase();
    qname == domain || qname.ends_with(&format!(".{}", domain))
}

struct NetmapDns {
    coordinator: Arc<Coordinator>,
    resolver: TokioAsyncResolver,
    base_domain: Option<String>,
}

impl NetmapDns {
    async fn respond<R>(
        &self,
        request: &Request,
        mut response_handle: R,
        mut header: Header,
        records: &[Record],
    ) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            records.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to send DNS response: {}", e);
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

#[async_trait]
impl RequestHandler for NetmapDns {
    async fn handle_request<R>(&self, request: &Request, response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let query = request.query();
        let qname = query.name().to_string().trim_end_matches('.').to_string();
        let qtype = query.query_type();
        let name: Name = query.name().clone().into();

        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(true);

        // Overlay names: single labels or anything under the base domain.
        let in_overlay = !qname.contains('.')
            || self
                .base_domain
                .as_deref()
                .is_some_and(|domain| is_within(&qname, domain));

        if in_overlay {
            let records = match self.coordinator.resolve(&qname).await {
                Some(addrs) => {
                    header.set_response_code(ResponseCode::NoError);
                    address_records(&name, qtype, NODE_TTL, &addrs)
                }
                None => {
                    header.set_response_code(ResponseCode::NXDomain);
                    Vec::new()
                }
            };
            return self.respond(request, response_handle, header, &records).await;
        }

        match self.resolver.lookup_ip(qname.clone()).await {
            Ok(lookup) => {
                let addrs: Vec<IpAddr> = lookup.iter().collect();
                let records = address_records(&name, qtype, UPSTREAM_TTL, &addrs);
                header.set_response_code(ResponseCode::NoError);
                self.respond(request, response_handle, header, &records).await
            }
            Err(e) => {
                warn!("Resolver lookup failed for {}: {}", qname, e);
                header.set_response_code(ResponseCode::ServFail);
                self.respond(request, response_handle, header, &[]).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_records_filter_by_type() {
        let name = Name::from_ascii("web.alice.example.com.").unwrap();
        let addrs: Vec<IpAddr> = vec!["100.64.0.1".parse().unwrap(), "fd7a::1".parse().unwrap()];

        let a = address_records(&name, RecordType::A, NODE_TTL, &addrs);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].record_type(), RecordType::A);

        let aaaa = address_records(&name, RecordType::AAAA, NODE_TTL, &addrs);
        assert_eq!(aaaa.len(), 1);
        assert_eq!(aaaa[0].record_type(), RecordType::AAAA);

        assert_eq!(address_records(&name, RecordType::ANY, NODE_TTL, &addrs).len(), 2);
        assert!(address_records(&name, RecordType::MX, NODE_TTL, &addrs).is_empty());
    }

    #[test]
    fn test_is_within_domain() {
        assert!(is_within("web.alice.example.com", "example.com"));
        assert!(is_within("WEB.Alice.Example.com", "example.com"));
        assert!(is_within("example.com", "example.com"));
        assert!(!is_within("notexample.com", "example.com"));
    }
}
