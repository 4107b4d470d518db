//! Next resolution stage: relay queries to one upstream resolver.
//!
//! Queries go out over UDP; a truncated UDP answer is retried over TCP. The
//! upstream answer is copied back under the client's message id, EDNS
//! included. Failures are answered with SERVFAIL.

use async_trait::async_trait;
use hickory_proto::op::{Edns, Header, Message, MessageType, ResponseCode};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::ForwardError;
use crate::metrics::{self, ForwardResult, Timer};

/// Largest DNS message over UDP or TCP.
const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Relays every request to a single upstream resolver.
#[derive(Debug, Clone)]
pub struct UpstreamForwarder {
    upstream: SocketAddr,
    timeout: Duration,
}

impl UpstreamForwarder {
    /// Forward to `upstream`, waiting at most `timeout` per exchange.
    pub fn new(upstream: SocketAddr, timeout: Duration) -> Self {
        Self { upstream, timeout }
    }

    /// Send `query` upstream and return the answer.
    pub async fn exchange(&self, query: &Message) -> Result<(Message, ForwardResult), ForwardError> {
        let wire = query.to_vec()?;

        let response = self.exchange_udp(&wire).await?;
        check_id(query, &response)?;

        if !response.truncated() {
            return Ok((response, ForwardResult::Udp));
        }

        trace!(upstream = %self.upstream, "response truncated, retrying with TCP");
        let response = self.exchange_tcp(&wire).await?;
        check_id(query, &response)?;
        Ok((response, ForwardResult::Tcp))
    }

    async fn exchange_udp(&self, wire: &[u8]) -> Result<Message, ForwardError> {
        let bind = if self.upstream.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.upstream).await?;
        socket.send(wire).await?;

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let len = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ForwardError::Timeout)??;

        Ok(Message::from_vec(&buf[..len])?)
    }

    async fn exchange_tcp(&self, wire: &[u8]) -> Result<Message, ForwardError> {
        let mut stream = timeout(self.timeout, TcpStream::connect(self.upstream))
            .await
            .map_err(|_| ForwardError::Timeout)??;

        // Length-prefixed message
        let len = wire.len() as u16;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(wire).await?;

        let mut len_buf = [0u8; 2];
        timeout(self.timeout, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| ForwardError::Timeout)??;

        let resp_len = u16::from_be_bytes(len_buf) as usize;
        let mut resp_buf = vec![0u8; resp_len];
        timeout(self.timeout, stream.read_exact(&mut resp_buf))
            .await
            .map_err(|_| ForwardError::Timeout)??;

        Ok(Message::from_vec(&resp_buf)?)
    }
}

fn check_id(query: &Message, response: &Message) -> Result<(), ForwardError> {
    if response.id() != query.id() {
        return Err(ForwardError::IdMismatch {
            expected: query.id(),
            got: response.id(),
        });
    }
    Ok(())
}

/// Build the upstream query for `request`.
fn upstream_query(request: &Request) -> Message {
    let mut query = Message::new();
    query
        .set_id(request.id())
        .set_message_type(MessageType::Query)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired());
    for q in request.queries() {
        query.add_query(q.original().clone());
    }
    if let Some(edns) = request.edns() {
        query.set_edns(edns.clone());
    }
    query
}

/// Header for the client answer, carrying the upstream's flags and code.
fn response_header(request: &Request, upstream: &Header) -> Header {
    let mut header = Header::response_from_request(request.header());
    header
        .set_response_code(upstream.response_code())
        .set_authoritative(upstream.authoritative())
        .set_truncated(upstream.truncated())
        .set_recursion_available(upstream.recursion_available())
        .set_authentic_data(upstream.authentic_data());
    header
}

/// OPT record for a locally built answer to a client that sent `request_edns`.
fn client_edns(request_edns: &Edns) -> Edns {
    let mut edns = Edns::new();
    edns.set_max_payload(request_edns.max_payload().max(512));
    edns
}

fn servfail_info() -> ResponseInfo {
    let mut header = Header::new();
    header.set_response_code(ResponseCode::ServFail);
    header.into()
}

#[async_trait]
impl RequestHandler for UpstreamForwarder {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let timer = Timer::start();
        let query = upstream_query(request);
        let mut builder = MessageResponseBuilder::from_message_request(request);

        let result = match self.exchange(&query).await {
            Ok((answer, result)) => {
                metrics::record_forward(result, timer.elapsed());
                debug!(
                    id = request.id(),
                    code = ?answer.response_code(),
                    answers = answer.answers().len(),
                    "relayed upstream answer"
                );
                let header = response_header(request, answer.header());
                // OPT goes back only to clients that sent one.
                if let (Some(_), Some(edns)) = (request.edns(), answer.extensions()) {
                    builder.edns(edns.clone());
                }
                let response = builder.build(
                    header,
                    answer.answers().iter(),
                    answer.name_servers().iter(),
                    std::iter::empty(),
                    answer.additionals().iter(),
                );
                response_handle.send_response(response).await
            }
            Err(e) => {
                let result = match e {
                    ForwardError::Timeout => ForwardResult::Timeout,
                    _ => ForwardResult::Error,
                };
                metrics::record_forward(result, timer.elapsed());
                warn!(upstream = %self.upstream, error = %e, "upstream query failed");
                if let Some(edns) = request.edns() {
                    builder.edns(client_edns(edns));
                }
                let response = builder.error_msg(request.header(), ResponseCode::ServFail);
                response_handle.send_response(response).await
            }
        };

        result.unwrap_or_else(|e| {
            warn!(error = %e, "failed to send response");
            servfail_info()
        })
    }
}
