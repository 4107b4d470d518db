//! DNS proxy setup and lifecycle management.

use hickory_server::ServerFuture;
use kube::Client;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::KubeEndpointCache;
use crate::config::{Config, DetectionMode};
use crate::counter::EmptyEndpointCounter;
use crate::error::ProxyError;
use crate::forward::UpstreamForwarder;
use crate::handler::EmptyEndpointsHandler;
use crate::oracle::{EndpointCacheLookup, EndpointStateOracle};
use crate::service::NamespaceAllowList;

/// DNS proxy that detects queries for services with no ready endpoints.
pub struct DnsProxy {
    config: Config,
    counter: EmptyEndpointCounter,
}

impl DnsProxy {
    /// Create a new proxy with the given configuration.
    pub fn new(config: Config) -> Self {
        let counter = EmptyEndpointCounter::new(
            &config.detection.metric_namespace,
            &config.detection.metric_subsystem,
        );
        Self { config, counter }
    }

    /// Counter the proxy increments.
    pub fn counter(&self) -> &EmptyEndpointCounter {
        &self.counter
    }

    /// Build the detection oracle for the configured mode.
    ///
    /// A Kubernetes client that cannot be built disables lookups instead of
    /// failing startup.
    async fn build_oracle(
        &self,
        namespaces: &NamespaceAllowList,
        shutdown: &CancellationToken,
    ) -> EndpointStateOracle {
        match self.config.detection.mode {
            DetectionMode::Observe => EndpointStateOracle::ResponseObserver,
            DetectionMode::Lookup => match Client::try_default().await {
                Ok(client) => {
                    let cache = KubeEndpointCache::start(client, namespaces, shutdown.child_token());
                    EndpointStateOracle::CacheLookup(EndpointCacheLookup::new(
                        Arc::new(cache),
                        self.config.detection.lookup_timeout(),
                    ))
                }
                Err(e) => {
                    warn!(
                        "Failed to create Kubernetes client, empty-endpoint detection disabled: {}",
                        e
                    );
                    EndpointStateOracle::CacheLookup(EndpointCacheLookup::disabled())
                }
            },
        }
    }

    /// Run the proxy until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        self.config.validate()?;

        let dns = &self.config.dns;
        let detection = &self.config.detection;
        let namespaces = NamespaceAllowList::new(detection.namespaces.iter().cloned());

        info!(
            listen_addr = %dns.listen_addr,
            upstream_addr = %dns.upstream_addr,
            mode = ?detection.mode,
            namespaces = ?namespaces.namespaces(),
            metric = self.counter.name(),
            "Starting emptyendpoints-dns proxy"
        );

        let oracle = self.build_oracle(&namespaces, &shutdown).await;
        let forwarder = UpstreamForwarder::new(dns.upstream_addr, dns.upstream_timeout());
        let handler = EmptyEndpointsHandler::new(forwarder, namespaces, oracle, self.counter.clone());

        let mut server = ServerFuture::new(handler);

        let udp_socket = UdpSocket::bind(dns.listen_addr).await?;
        info!(addr = %dns.listen_addr, "DNS UDP listening");
        server.register_socket(udp_socket);

        let tcp_listener = TcpListener::bind(dns.listen_addr).await?;
        info!(addr = %dns.listen_addr, "DNS TCP listening");
        server.register_listener(tcp_listener, dns.tcp_timeout());

        info!("DNS proxy ready to serve queries");

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("DNS proxy shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {}", e);
                    shutdown.cancel();
                    return Err(e.into());
                }
            }
        }

        info!("DNS proxy stopped");
        Ok(())
    }
}
