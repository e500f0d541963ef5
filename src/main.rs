use sd_registry::metrics;
use sd_registry::utils::wait_for_shutdown_signal;
use sd_registry::Result;
use sd_registry::RegistryConfig;
use sd_registry::ServiceRegistry;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    init_observability();

    let config_path = std::env::args().nth(1);
    let settings = RegistryConfig::load(config_path.as_deref())?;

    // Initializing Shutdown Signal
    let (graceful_tx, graceful_rx) = watch::channel(());

    let metrics_server = settings.monitoring.prometheus_enabled.then(|| {
        let port = settings.monitoring.prometheus_port;
        tokio::spawn(metrics::start_server(port, graceful_rx.clone()))
    });

    let registry = match ServiceRegistry::register(settings.registration.clone(), &settings).await {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "registration failed");
            return Err(e);
        }
    };
    let me = registry.self_record();
    info!(id = %me.id, server_type = %me.server_type, "registered. Waiting for shutdown signal...");

    wait_for_shutdown_signal().await;

    if let Err(e) = registry.shutdown().await {
        error!(error = %e, "registry shutdown failed");
    }
    let _ = graceful_tx.send(());
    if let Some(server) = metrics_server {
        if let Err(e) = server.await {
            error!(error = %e, "metrics server task failed");
        }
    }

    info!("Shutdown completed");
    Ok(())
}

fn init_observability() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::registry().with(fmt_layer).init();
}
