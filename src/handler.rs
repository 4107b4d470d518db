//! Request pipeline placed in front of the next resolution stage.
//!
//! For every request: parse the first question into a [`ServiceRef`], check
//! the namespace allow-list, consult the oracle, count empty services, then
//! hand the request to the next stage. The request is always forwarded
//! exactly once and the answer is never altered.

use async_trait::async_trait;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::sync::Arc;
use tracing::trace;

use crate::counter::EmptyEndpointCounter;
use crate::metrics::{self, QueryOutcome};
use crate::oracle::{Emptiness, EndpointStateOracle, ObservingResponseHandler};
use crate::service::{NamespaceAllowList, ServiceRef};

/// `RequestHandler` decorator that detects queries for empty services.
pub struct EmptyEndpointsHandler<H> {
    next: H,
    namespaces: NamespaceAllowList,
    oracle: Arc<EndpointStateOracle>,
    counter: EmptyEndpointCounter,
}

impl<H: RequestHandler> EmptyEndpointsHandler<H> {
    /// Wrap `next` with detection.
    pub fn new(
        next: H,
        namespaces: NamespaceAllowList,
        oracle: EndpointStateOracle,
        counter: EmptyEndpointCounter,
    ) -> Self {
        Self {
            next,
            namespaces,
            oracle: Arc::new(oracle),
            counter,
        }
    }

    /// Counter incremented by this handler.
    pub fn counter(&self) -> &EmptyEndpointCounter {
        &self.counter
    }

    /// Service the request is about, if it should be watched.
    fn watched_service(&self, request: &Request) -> Option<ServiceRef> {
        let Some(query) = request.queries().first() else {
            metrics::record_query(QueryOutcome::NotService);
            return None;
        };

        let qname = query.name().to_string();
        let Some(service) = ServiceRef::parse(&qname) else {
            trace!(name = %qname, "not a service query");
            metrics::record_query(QueryOutcome::NotService);
            return None;
        };

        if !self.namespaces.watches(&service) {
            trace!(%service, "namespace not watched");
            metrics::record_query(QueryOutcome::Filtered);
            return None;
        }

        metrics::record_query(QueryOutcome::Watched);
        Some(service)
    }
}

#[async_trait]
impl<H: RequestHandler> RequestHandler for EmptyEndpointsHandler<H> {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        let Some(service) = self.watched_service(request) else {
            return self.next.handle_request(request, response_handle).await;
        };

        let decision = self.oracle.is_empty(&service).await;
        trace!(%service, strategy = self.oracle.name(), ?decision, "checked endpoints");
        if decision == Emptiness::Empty {
            self.counter.increment(&service);
        }

        if self.oracle.observes_responses() {
            let observer = ObservingResponseHandler::new(response_handle, service, self.counter.clone());
            self.next.handle_request(request, observer).await
        } else {
            self.next.handle_request(request, response_handle).await
        }
    }
}
