//! Shared test infrastructure for pipeline integration tests.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Edns, Header, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse, MessageResponseBuilder};
use hickory_server::proto::rr::Record;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};

use emptyendpoints_dns::cache::{EndpointCache, EndpointSnapshot};
use emptyendpoints_dns::error::LookupError;
use emptyendpoints_dns::service::ServiceRef;

// --- TestResponseHandler ---

/// Captures every serialized DNS response for inspection in tests.
///
/// The response is serialized via `MessageResponse::destructive_emit()` and
/// stored as raw wire-format bytes, which can then be parsed with
/// `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of responses written through this handler (or its clones).
    pub fn send_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Parse the single captured response.
    pub fn into_message(self) -> Message {
        let sent = self.sent.lock().unwrap();
        assert_eq!(sent.len(), 1, "expected exactly one response");
        Message::from_vec(&sent[0]).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = Vec::with_capacity(512);
        let mut encoder = BinEncoder::new(&mut buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.sent.lock().unwrap().push(buf);
        Ok(info)
    }
}

/// Response handler whose every write fails.
#[derive(Clone)]
pub struct FailingResponseHandler;

#[async_trait]
impl ResponseHandler for FailingResponseHandler {
    async fn send_response<'a>(
        &mut self,
        _response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }
}

// --- Next stage ---

/// Next resolution stage that answers every query with a fixed response code.
#[derive(Clone)]
pub struct StaticResponder {
    code: ResponseCode,
    calls: Arc<AtomicUsize>,
}

impl StaticResponder {
    pub fn new(code: ResponseCode) -> Self {
        Self {
            code,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared call counter, readable after the responder is moved into a handler.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl RequestHandler for StaticResponder {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.error_msg(request.header(), self.code);
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(_) => {
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

// --- Endpoint caches ---

/// In-memory endpoint cache. Services without an entry are not found.
#[derive(Default)]
pub struct MapCache {
    entries: Mutex<Vec<(ServiceRef, EndpointSnapshot)>>,
    calls: AtomicUsize,
}

impl MapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, namespace: &str, service: &str, snapshot: EndpointSnapshot) -> Self {
        self.entries
            .lock()
            .unwrap()
            .push((ServiceRef::new(namespace, service), snapshot));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointCache for MapCache {
    async fn get(&self, service: &ServiceRef) -> Result<EndpointSnapshot, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|(svc, _)| svc == service)
            .map(|(_, snapshot)| snapshot.clone())
            .ok_or_else(|| LookupError::NotFound {
                namespace: service.namespace.clone(),
                service: service.service.clone(),
            })
    }
}

/// Cache that never answers in time.
pub struct HangingCache;

#[async_trait]
impl EndpointCache for HangingCache {
    async fn get(&self, _service: &ServiceRef) -> Result<EndpointSnapshot, LookupError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(EndpointSnapshot::default())
    }
}

/// Snapshot with one subset and no addresses.
pub fn empty_snapshot() -> EndpointSnapshot {
    EndpointSnapshot::from_addresses([Vec::<String>::new()])
}

/// Snapshot with one ready address.
pub fn ready_snapshot() -> EndpointSnapshot {
    EndpointSnapshot::from_addresses([vec!["10.244.0.12"]])
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    query_message(name, record_type, id).to_vec().unwrap()
}

/// Query message for `name`, recursion desired.
pub fn query_message(name: &str, record_type: RecordType, id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` for an A query.
pub fn build_request(name: &str, id: u16) -> Request {
    let bytes = build_query_bytes(name, RecordType::A, id);
    let msg = parse_message_request(&bytes);
    let src: SocketAddr = "10.244.1.5:40000".parse().unwrap();
    Request::new(msg, src, Protocol::Udp)
}

/// Build a `Request` for an A query carrying an OPT record.
pub fn build_edns_request(name: &str, id: u16, max_payload: u16) -> Request {
    let mut msg = query_message(name, RecordType::A, id);
    let mut edns = Edns::new();
    edns.set_max_payload(max_payload);
    msg.set_edns(edns);

    let src: SocketAddr = "10.244.1.5:40000".parse().unwrap();
    Request::new(parse_message_request(&msg.to_vec().unwrap()), src, Protocol::Udp)
}

/// Run one request through `handler` and return the parsed response.
pub async fn execute_request<H: RequestHandler>(handler: &H, request: &Request) -> Message {
    let response = TestResponseHandler::new();
    handler.handle_request(request, response.clone()).await;
    response.into_message()
}

/// Run one query through `handler` and return the parsed response.
pub async fn execute_query<H: RequestHandler>(handler: &H, name: &str, id: u16) -> Message {
    let request = build_request(name, id);
    let response = TestResponseHandler::new();
    handler.handle_request(&request, response.clone()).await;
    response.into_message()
}
