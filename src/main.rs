mod api;
mod backend;
mod config;
mod dispatch;
mod engine;
mod housekeeping;
mod metrics;
mod server;
mod watch;

use crate::backend::{CircuitBreaker, HttpBackend, MockBackend, ScanBackend};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::engine::Model;
use crate::housekeeping::Housekeeping;
use crate::metrics::{Metrics, TracingMetrics};
use crate::server::ServerConfig;
use clap::Parser;
use futures::future::{BoxFuture, FutureExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{runtime::watcher, Api, Client};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let metrics: Arc<dyn Metrics> = Arc::new(TracingMetrics);

    let backend: Arc<dyn ScanBackend> = if config.mock {
        info!("Using mock backend");
        Arc::new(MockBackend::new())
    } else {
        info!(url = %config.backend_url, "Using HTTP backend");
        Arc::new(HttpBackend::new(
            config.backend_url.clone(),
            config.backend_timeout,
        )?)
    };

    let stop = CancellationToken::new();
    let breaker = CircuitBreaker::new(config.max_backoff, metrics.clone());
    let (timings_tx, timings_rx) = tokio::sync::watch::channel(config.timings.clone());

    let model = Model::new(config.model_config(), metrics.clone());
    let (engine, runner) = engine::engine(model, timings_tx, metrics, stop.clone());

    let dispatcher = Dispatcher::new(
        engine.clone(),
        backend,
        breaker.clone(),
        timings_rx.clone(),
        stop.clone(),
    )
    .run();
    let housekeeping =
        Housekeeping::new(engine.clone(), breaker.clone(), timings_rx, stop.clone()).run();

    // pod watcher

    let pods: BoxFuture<anyhow::Result<()>> = if config.watch {
        let client = Client::try_default().await?;
        let api: Api<Pod> = Api::all(client);
        let stream = watcher(api, watcher::Config::default());
        watch::run(engine.clone(), stream).boxed()
    } else {
        info!("Not watching pods, expecting workloads through the API");
        futures::future::pending().boxed()
    };

    // server

    info!("Binding to {}", config.bind_addr);

    let server = server::run(
        ServerConfig {
            bind_addr: config.bind_addr.clone(),
        },
        engine,
        breaker,
    );

    let result = tokio::select! {
        result = server => result,
        result = runner => result,
        result = dispatcher => result,
        result = housekeeping => result,
        result = pods => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt");
            Ok(())
        }
    };

    stop.cancel();
    info!("Shutting down");

    result
}
