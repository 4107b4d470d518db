//! Deciding whether a service currently has zero ready endpoints.
//!
//! Two strategies exist and a deployment picks one:
//!
//! - [`EndpointStateOracle::ResponseObserver`] defers the decision until the
//!   downstream resolver writes its answer and treats NXDOMAIN as "empty".
//!   The inspection happens in [`ObservingResponseHandler`].
//! - [`EndpointStateOracle::CacheLookup`] asks the endpoint cache before the
//!   query is forwarded.
//!
//! Both fail open: anything short of positive evidence of emptiness is
//! reported as [`Emptiness::NotEmpty`].

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_server::authority::MessageResponse;
use hickory_server::proto::rr::Record;
use hickory_server::server::{ResponseHandler, ResponseInfo};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::cache::EndpointCache;
use crate::counter::EmptyEndpointCounter;
use crate::error::LookupError;
use crate::metrics::{self, LookupResult, Timer};
use crate::service::ServiceRef;

/// Outcome of an emptiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emptiness {
    /// The service has no ready endpoints.
    Empty,
    /// The service has ready endpoints, or the answer is not known for sure.
    NotEmpty,
    /// No decision yet; it is made when the answer is written.
    Unknown,
}

/// Emptiness decision strategy.
pub enum EndpointStateOracle {
    /// Decide from the downstream response code.
    ResponseObserver,
    /// Decide from the endpoint cache before forwarding.
    CacheLookup(EndpointCacheLookup),
}

impl EndpointStateOracle {
    /// Decide before forwarding.
    ///
    /// The observer always answers [`Emptiness::Unknown`] here.
    pub async fn is_empty(&self, service: &ServiceRef) -> Emptiness {
        match self {
            Self::ResponseObserver => Emptiness::Unknown,
            Self::CacheLookup(lookup) => lookup.is_empty(service).await,
        }
    }

    /// True if the response channel must be wrapped for this strategy.
    pub fn observes_responses(&self) -> bool {
        matches!(self, Self::ResponseObserver)
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResponseObserver => "observe",
            Self::CacheLookup(_) => "lookup",
        }
    }
}

/// Emptiness decision from a downstream response code.
pub fn decide_from_response(code: ResponseCode) -> Emptiness {
    if code == ResponseCode::NXDomain {
        Emptiness::Empty
    } else {
        Emptiness::NotEmpty
    }
}

/// Active strategy: consult the endpoint cache with a bounded wait.
pub struct EndpointCacheLookup {
    cache: Option<Arc<dyn EndpointCache>>,
    timeout: Duration,
}

impl EndpointCacheLookup {
    /// Lookup against `cache`, giving up after `timeout`.
    pub fn new(cache: Arc<dyn EndpointCache>, timeout: Duration) -> Self {
        Self {
            cache: Some(cache),
            timeout,
        }
    }

    /// Lookup with no cache; every decision is [`Emptiness::NotEmpty`].
    pub fn disabled() -> Self {
        Self {
            cache: None,
            timeout: Duration::ZERO,
        }
    }

    /// Decide emptiness of `service`. Never returns [`Emptiness::Unknown`].
    pub async fn is_empty(&self, service: &ServiceRef) -> Emptiness {
        let timer = Timer::start();

        let Some(cache) = &self.cache else {
            trace!(%service, "no endpoint cache configured");
            metrics::record_lookup(LookupResult::Unavailable, timer.elapsed());
            return Emptiness::NotEmpty;
        };

        let result = match tokio::time::timeout(self.timeout, cache.get(service)).await {
            Ok(result) => result,
            Err(_) => Err(LookupError::Timeout),
        };

        let (decision, lookup_result) = match result {
            Ok(snapshot) if snapshot.has_ready_addresses() => {
                (Emptiness::NotEmpty, LookupResult::Ready)
            }
            Ok(_) => (Emptiness::Empty, LookupResult::Empty),
            Err(e) => {
                debug!(%service, error = %e, "endpoint lookup failed, assuming endpoints exist");
                let lookup_result = match e {
                    LookupError::NotFound { .. } => LookupResult::NotFound,
                    LookupError::Timeout => LookupResult::Timeout,
                    LookupError::Kube(_) => LookupResult::Error,
                };
                (Emptiness::NotEmpty, lookup_result)
            }
        };

        metrics::record_lookup(lookup_result, timer.elapsed());
        decision
    }
}

/// Response handler that counts NXDOMAIN answers before passing them on.
///
/// Every response is delegated to the wrapped handler exactly once and
/// unchanged; its result, including errors, is returned as is.
#[derive(Clone)]
pub struct ObservingResponseHandler<R> {
    inner: R,
    service: ServiceRef,
    counter: EmptyEndpointCounter,
}

impl<R: ResponseHandler> ObservingResponseHandler<R> {
    /// Wrap `inner`, attributing empty answers to `service`.
    pub fn new(inner: R, service: ServiceRef, counter: EmptyEndpointCounter) -> Self {
        Self {
            inner,
            service,
            counter,
        }
    }
}

#[async_trait]
impl<R: ResponseHandler> ResponseHandler for ObservingResponseHandler<R> {
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
        let code = response.header().response_code();
        if decide_from_response(code) == Emptiness::Empty {
            self.counter.increment(&self.service);
        }
        trace!(service = %self.service, ?code, "observed response");

        self.inner.send_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EndpointSnapshot;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedCache {
        result: fn() -> Result<EndpointSnapshot, LookupError>,
        calls: AtomicUsize,
    }

    impl FixedCache {
        fn new(result: fn() -> Result<EndpointSnapshot, LookupError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EndpointCache for FixedCache {
        async fn get(&self, _service: &ServiceRef) -> Result<EndpointSnapshot, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    struct SlowCache;

    #[async_trait]
    impl EndpointCache for SlowCache {
        async fn get(&self, _service: &ServiceRef) -> Result<EndpointSnapshot, LookupError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(EndpointSnapshot::default())
        }
    }

    fn web() -> ServiceRef {
        ServiceRef::new("default", "web")
    }

    fn lookup(cache: Arc<dyn EndpointCache>) -> EndpointCacheLookup {
        EndpointCacheLookup::new(cache, Duration::from_millis(50))
    }

    #[test]
    fn test_nxdomain_is_empty() {
        assert_eq!(decide_from_response(ResponseCode::NXDomain), Emptiness::Empty);
    }

    #[test]
    fn test_other_codes_are_not_empty() {
        for code in [
            ResponseCode::NoError,
            ResponseCode::ServFail,
            ResponseCode::Refused,
            ResponseCode::FormErr,
        ] {
            assert_eq!(decide_from_response(code), Emptiness::NotEmpty, "{code:?}");
        }
    }

    #[tokio::test]
    async fn test_observer_defers_decision() {
        let oracle = EndpointStateOracle::ResponseObserver;
        assert_eq!(oracle.is_empty(&web()).await, Emptiness::Unknown);
        assert!(oracle.observes_responses());
    }

    #[tokio::test]
    async fn test_lookup_all_subsets_empty_is_empty() {
        let cache = FixedCache::new(|| Ok(EndpointSnapshot::from_addresses([Vec::<String>::new(), vec![]])));
        let oracle = EndpointStateOracle::CacheLookup(lookup(cache.clone()));

        assert_eq!(oracle.is_empty(&web()).await, Emptiness::Empty);
        assert_eq!(cache.calls.load(Ordering::SeqCst), 1);
        assert!(!oracle.observes_responses());
    }

    #[tokio::test]
    async fn test_lookup_no_subsets_is_empty() {
        let cache = FixedCache::new(|| Ok(EndpointSnapshot::default()));
        assert_eq!(lookup(cache).is_empty(&web()).await, Emptiness::Empty);
    }

    #[tokio::test]
    async fn test_lookup_with_ready_address_is_not_empty() {
        let cache = FixedCache::new(|| Ok(EndpointSnapshot::from_addresses([vec![], vec!["10.0.0.1"]])));
        assert_eq!(lookup(cache).is_empty(&web()).await, Emptiness::NotEmpty);
    }

    #[tokio::test]
    async fn test_lookup_not_found_fails_open() {
        let cache = FixedCache::new(|| {
            Err(LookupError::NotFound {
                namespace: "default".to_string(),
                service: "web".to_string(),
            })
        });
        assert_eq!(lookup(cache).is_empty(&web()).await, Emptiness::NotEmpty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_timeout_fails_open() {
        let oracle = lookup(Arc::new(SlowCache));
        let decided = tokio::time::timeout(Duration::from_secs(5), oracle.is_empty(&web()))
            .await
            .expect("lookup must respect its own timeout");
        assert_eq!(decided, Emptiness::NotEmpty);
    }

    #[tokio::test]
    async fn test_disabled_lookup_fails_open() {
        let oracle = EndpointCacheLookup::disabled();
        assert_eq!(oracle.is_empty(&web()).await, Emptiness::NotEmpty);
    }
}
