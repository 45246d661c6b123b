//! UDP DNS interceptor and forwarder

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::DnsError;

/// TTL of synthesized interception answers
const INTERCEPT_TTL: u32 = 300;

/// Largest message accepted on the wire (EDNS ceiling)
const MAX_DATAGRAM: usize = 4096;

/// DNS server configuration
#[derive(Clone, Debug)]
pub struct DnsConfig {
    /// Bind address for the UDP listener
    pub bind: SocketAddr,
    /// Resolver that answers everything we do not intercept
    pub upstream: SocketAddr,
    /// Hostname whose A queries are answered with `redirect_ip`
    pub intercept_host: String,
    /// Mirror address handed to intercepted clients
    pub redirect_ip: Ipv4Addr,
    /// How long to wait for the upstream resolver before SERVFAIL
    pub forward_timeout: Duration,
}

struct Inner {
    /// Normalized (lowercase, no trailing dot) intercepted hostname
    intercept_host: String,
    redirect_ip: Ipv4Addr,
    upstream: SocketAddr,
    forward_timeout: Duration,
}

/// UDP DNS server.
///
/// Each incoming datagram is handled on its own spawned worker, so a
/// slow upstream never blocks the receive loop.
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    inner: Arc<Inner>,
}

impl DnsServer {
    /// Bind the UDP listener
    pub async fn bind(config: DnsConfig) -> Result<Self, DnsError> {
        let socket = UdpSocket::bind(config.bind).await?;
        info!(
            "DNS server listening on {}, intercepting {} -> {}",
            socket.local_addr()?,
            config.intercept_host,
            config.redirect_ip
        );

        Ok(Self {
            socket: Arc::new(socket),
            inner: Arc::new(Inner {
                intercept_host: normalize_host(&config.intercept_host),
                redirect_ip: config.redirect_ip,
                upstream: config.upstream,
                forward_timeout: config.forward_timeout,
            }),
        })
    }

    /// The bound local address
    pub fn local_addr(&self) -> Result<SocketAddr, DnsError> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve queries until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), DnsError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("DNS server shutting down");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = received?;
                    let packet = buf[..len].to_vec();
                    let socket = self.socket.clone();
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        handle_query(socket, inner, packet, peer).await;
                    });
                }
            }
        }
    }
}

async fn handle_query(socket: Arc<UdpSocket>, inner: Arc<Inner>, packet: Vec<u8>, peer: SocketAddr) {
    let query = match Message::from_vec(&packet) {
        Ok(query) => query,
        Err(e) => {
            debug!("Dropping unparseable datagram from {}: {}", peer, e);
            return;
        }
    };

    if let Some(question) = query
        .queries()
        .iter()
        .find(|q| q.query_type() == RecordType::A && normalize_name(q.name()) == inner.intercept_host)
    {
        debug!(
            "Intercepting A {} from {} -> {}",
            question.name(),
            peer,
            inner.redirect_ip
        );
        match intercept_response(&query, question, inner.redirect_ip) {
            Ok(reply) => {
                if let Err(e) = socket.send_to(&reply, peer).await {
                    warn!("Failed to send interception answer to {}: {}", peer, e);
                }
            }
            Err(e) => warn!("Failed to encode interception answer: {}", e),
        }
        return;
    }

    // Everything else is relayed byte-for-byte.
    match forward(&packet, inner.upstream, inner.forward_timeout).await {
        Ok(reply) => {
            if let Err(e) = socket.send_to(&reply, peer).await {
                warn!("Failed to relay upstream answer to {}: {}", peer, e);
            }
        }
        Err(e) => {
            debug!("Upstream resolver failed for {}: {}", peer, e);
            match servfail_response(&query) {
                Ok(reply) => {
                    if let Err(e) = socket.send_to(&reply, peer).await {
                        warn!("Failed to send SERVFAIL to {}: {}", peer, e);
                    }
                }
                Err(e) => warn!("Failed to encode SERVFAIL: {}", e),
            }
        }
    }
}

/// Relay the original datagram to the upstream resolver
async fn forward(
    packet: &[u8],
    upstream: SocketAddr,
    wait: Duration,
) -> Result<Vec<u8>, DnsError> {
    let bind_addr: SocketAddr = if upstream.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(upstream).await?;
    socket.send(packet).await?;

    let mut buf = [0u8; MAX_DATAGRAM];
    let len = timeout(wait, socket.recv(&mut buf))
        .await
        .map_err(|_| DnsError::UpstreamTimeout)??;
    Ok(buf[..len].to_vec())
}

/// Build the authoritative single-A-record answer for an intercepted query
fn intercept_response(
    query: &Message,
    question: &Query,
    redirect_ip: Ipv4Addr,
) -> Result<Vec<u8>, DnsError> {
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_authoritative(true)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    response.add_query(question.clone());
    response.add_answer(Record::from_rdata(
        question.name().clone(),
        INTERCEPT_TTL,
        RData::A(A::from(redirect_ip)),
    ));
    Ok(response.to_vec()?)
}

/// Build a SERVFAIL echoing the query's id and questions
fn servfail_response(query: &Message) -> Result<Vec<u8>, DnsError> {
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::ServFail);
    for question in query.queries() {
        response.add_query(question.clone());
    }
    Ok(response.to_vec()?)
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn normalize_name(name: &Name) -> String {
    normalize_host(&name.to_ascii())
}
