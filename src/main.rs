//! Helmsman binary entry point.

use helmsman::config;
use helmsman::modules::autoscale::{AutoScaler, ScaleEvent, ScalingStateManager};
use helmsman::modules::discovery::{
    BackendFactory, DiscoveryManager, MemoryCatalog, ServiceCatalog, ServiceInstance,
};
use helmsman::modules::dispatcher::{Dispatcher, FrontEnd};
use helmsman::modules::metrics::LbMetrics;
use helmsman::modules::policy::TrafficPolicyEngine;
use helmsman::modules::rate_limiting::RateLimiter;
use helmsman::modules::server_pool::{Backend, HealthProber, ServerPool};
use helmsman::modules::session::{MemoryStore, RedisStore, SharedStore, StickySessionManager};
use helmsman::modules::upstream::{Origin, Transport};
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting helmsman v{}", env!("CARGO_PKG_VERSION"));

    let settings = match config::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        },
    };
    let listen_addr = match settings.listen_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "Invalid listen address");
            std::process::exit(1);
        },
    };

    // Shared state: session store, pool, metrics, rolling request counter.
    let store: Arc<dyn SharedStore> = if settings.session.redis_enabled {
        let url = settings.session.redis_url.clone().unwrap_or_default();
        info!(%url, "Distributed session store enabled");
        Arc::new(RedisStore::new(url))
    } else {
        info!("Using in-process session store");
        Arc::new(MemoryStore::new())
    };

    let sessions = Arc::new(StickySessionManager::new(
        Arc::clone(&store),
        settings.session.key_prefix.clone(),
        settings.session.ttl(),
    ));
    let pool = Arc::new(ServerPool::with_sessions(sessions));
    let metrics = Arc::new(LbMetrics::new());
    let limiter = Arc::new(RateLimiter::new(settings.rate_limit.clone()));
    let request_counter = Arc::new(AtomicI64::new(0));

    let transport = match Transport::from_config(&settings.mtls) {
        Ok(transport) => transport,
        Err(e) => {
            error!(error = %e, "mTLS transport setup failed");
            std::process::exit(1);
        },
    };
    if settings.mtls.enabled {
        info!("mTLS enabled for upstream connections");
    }

    for backend_settings in &settings.backends {
        let backend = match Backend::new(
            &backend_settings.url,
            backend_settings.weight,
            &backend_settings.region,
        ) {
            Ok(backend) => Arc::new(backend.with_transport(transport.clone())),
            Err(e) => {
                error!(url = %backend_settings.url, error = %e, "Bad backend URL");
                std::process::exit(1);
            },
        };

        metrics.touch_backend(backend.id());
        if let Err(e) = pool.add(backend) {
            error!(error = %e, "Duplicate backend in configuration");
            std::process::exit(1);
        }
    }
    info!(count = pool.len(), "Registered backends");

    let mut dispatcher = Dispatcher::new(
        Arc::clone(&pool),
        Arc::clone(&limiter),
        Arc::clone(&metrics),
        Arc::clone(&request_counter),
    )
    .with_upstream_deadline(settings.upstream_deadline());

    if settings.policies.enabled {
        let engine = TrafficPolicyEngine::new(Arc::clone(&pool));
        for policy in settings.policies.policies.clone() {
            if let Err(e) = engine.add_policy(policy) {
                error!(error = %e, "Bad traffic policy");
                std::process::exit(1);
            }
        }
        info!(
            count = engine.policies().len(),
            "Traffic policy engine enabled"
        );
        dispatcher = dispatcher.with_policies(Arc::new(engine));
    } else {
        info!("Traffic policies disabled (set TRAFFIC_POLICIES_ENABLED=true to activate)");
    }

    let mut shutdowns: Vec<mpsc::Sender<()>> = Vec::new();

    // Discovery-driven backend set.
    if settings.discovery.enabled {
        let catalog = MemoryCatalog::with_instances(discovery_seed(&settings));
        let discovery_transport = transport.clone();
        let factory: BackendFactory = Box::new(move |instance: &ServiceInstance| {
            Ok(Arc::new(
                Backend::new(instance.url(), instance.weight, instance.region.clone())?
                    .with_transport(discovery_transport.clone()),
            ))
        });

        let (tx, rx) = mpsc::channel(1);
        shutdowns.push(tx);
        let manager =
            DiscoveryManager::new(Arc::clone(&pool), factory, catalog.subscribe(), rx);
        tokio::spawn(manager.run());

        info!(
            service = %settings.discovery.service,
            addr = %settings.discovery.addr.clone().unwrap_or_default(),
            "Service discovery enabled"
        );
    }

    // Health probing.
    {
        let (tx, rx) = mpsc::channel(1);
        shutdowns.push(tx);
        tokio::spawn(HealthProber::new(Arc::clone(&pool), settings.health.clone(), rx).run());
    }

    // Auto-scaling signals.
    {
        let scaling_state = ScalingStateManager::new(
            Arc::clone(&store),
            settings.session.key_prefix.clone(),
            Duration::from_secs(3600),
        );
        let (event_tx, mut event_rx) = mpsc::channel::<ScaleEvent>(16);
        let (tx, rx) = mpsc::channel(1);
        shutdowns.push(tx);
        tokio::spawn(
            AutoScaler::new(
                Arc::clone(&request_counter),
                settings.scaling.clone(),
                scaling_state,
                event_tx,
                rx,
            )
            .run(),
        );

        // The core only publishes scaling signals; the supervisor acts.
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    ScaleEvent::Up { replicas } => {
                        info!(replicas, "Supervisor signal: scale up");
                    },
                    ScaleEvent::Down { replicas } => {
                        info!(replicas, "Supervisor signal: scale down");
                    },
                }
            }
        });
    }

    let (front_tx, front_rx) = mpsc::channel(1);
    shutdowns.push(front_tx);
    let front = match FrontEnd::bind(listen_addr, Arc::new(dispatcher), metrics, front_rx).await
    {
        Ok(front) => front,
        Err(e) => {
            error!(addr = %listen_addr, error = %e, "Failed to bind listener");
            std::process::exit(1);
        },
    };

    info!("Endpoints: /lb (proxy), /health, /metrics, /prometheus, / (dashboard)");
    info!("Load balancer is ready to accept connections");

    tokio::select! {
        () = front.run() => {},
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    for tx in shutdowns {
        let _ = tx.send(()).await;
    }
    info!("Shutdown complete");
}

/// Seed the in-process catalog from the static backend set.
fn discovery_seed(settings: &config::Settings) -> Vec<ServiceInstance> {
    settings
        .backends
        .iter()
        .enumerate()
        .filter_map(|(i, b)| {
            let origin = Origin::parse(&b.url).ok()?;
            Some(ServiceInstance {
                id: format!("{}-{}", settings.discovery.service, i + 1),
                address: origin.host,
                port: origin.port,
                weight: b.weight,
                region: b.region.clone(),
                tags: Vec::new(),
            })
        })
        .collect()
}
