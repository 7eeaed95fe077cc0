//! Run the dispatch queues, their workers and the retention janitor.
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use dispatch_worker::app::app;
use dispatch_worker::config::Config;
use dispatch_worker::dry_run;
use dispatch_worker::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use dispatch_worker::system::JobSystem;

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.wrap_err("failed to listen for SIGINT")?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().wrap_err("invalid configuration")?;
    let recorder = setup_metrics_recorder().wrap_err("failed to install metrics recorder")?;

    let system = JobSystem::connect(config.store_target(), config.pool_config(), config.settings())
        .await
        .wrap_err("failed to initialize job store")?;

    system.start_all_workers(&dry_run::handlers())?;
    system.start_janitor(config.cleanup_interval());

    let router = setup_metrics_routes(app(system.liveness().clone()), recorder);
    let stop_serving = CancellationToken::new();
    let bind = config.bind();
    info!(%bind, "serving probes and metrics");
    let mut server = tokio::spawn({
        let stop_serving = stop_serving.clone();
        async move { serve(router, &bind, stop_serving).await }
    });

    let mut server_finished = false;
    tokio::select! {
        signalled = wait_for_shutdown_signal() => {
            if let Err(error) = signalled {
                error!(error = %format!("{error:#}"), "signal handling failed, shutting down");
            }
        }
        served = &mut server => {
            server_finished = true;
            match served {
                Ok(Ok(())) => info!("http server stopped"),
                Ok(Err(error)) => error!(%error, "http server failed"),
                Err(error) => error!(%error, "http server task failed"),
            }
        }
    }

    let shutdown = system.shutdown().await;
    stop_serving.cancel();
    if !server_finished {
        server.await??;
    }
    shutdown?;

    info!("dispatch worker exited");
    Ok(())
}
