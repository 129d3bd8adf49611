use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use feed_actors::data_source::JsonRpcDataSource;
use feed_actors::metrics::{create_shared_metrics, SharedMetrics};
use feed_actors::pipeline::Pipeline;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::config::{get_feeder_config, FeederConfig};
use crate::sink::JsonLinesSink;

mod config;
mod sink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ignore faillures as .env might not be present at runtime, and this use-case is tolerated
    dotenv()
        .inspect_err(|err| eprintln!("[WARN] reading .env files is failed with err {err}"))
        .ok();

    let config = get_feeder_config()?;
    let _guards = init_logging(&config);
    info!(
        rpc_url = %config.rpc_url,
        categories = %config.categories,
        start_block = config.start_block,
        mode = %config.feed_mode,
        consume = config.consume,
        "Starting feeder"
    );

    let source = Arc::new(JsonRpcDataSource::new(
        &config.rpc_url,
        Duration::from_millis(config.rpc_timeout_ms),
        config.topics()?,
        config.hub_address,
    )?);
    let metrics = create_shared_metrics();
    let pipeline = Pipeline::builder()
        .chain(source.clone())
        .query(source)
        .categories(config.categories.0.clone())
        .start_block(config.start_block)
        .poll_interval(Duration::from_millis(config.poll_interval_ms))
        .timeouts(config.timeouts())
        .mode(config.feed_mode)
        .consume(config.consume)
        .max_worker_retries(config.max_worker_retries)
        .max_restarts(config.max_restarts)
        .restart_delay(Duration::from_millis(config.restart_delay_ms))
        .healthy_after(Duration::from_secs(config.healthy_after_secs))
        .metrics(metrics.clone())
        .build();

    let (shutdown_metrics_tx, shutdown_metrics_rx) = oneshot::channel();
    let metrics_handle = tokio::spawn(log_metrics(
        metrics.clone(),
        Duration::from_secs(config.metrics_interval_secs.max(1)),
        shutdown_metrics_rx,
    ));

    let (shutdown_pipeline_tx, shutdown_pipeline_rx) = oneshot::channel();
    let mut pipeline_handle = tokio::spawn(pipeline.run(
        JsonLinesSink::new(tokio::io::stdout()),
        shutdown_pipeline_rx,
    ));

    let result = tokio::select! {
        result = &mut pipeline_handle => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Termination signal received. Shutting down...");
            _ = shutdown_pipeline_tx
                .send(())
                .inspect_err(|_| error!("failed to shutdown pipeline"));
            pipeline_handle.await
        }
    };

    _ = shutdown_metrics_tx
        .send(())
        .inspect_err(|_| error!("failed to shutdown metrics logger"));
    _ = metrics_handle.await;
    info!("{}", metrics.snapshot());

    result??;
    info!("All tasks shut down.");
    Ok(())
}

/// Logs to stderr, stdout carries the event stream.
fn init_logging(config: &FeederConfig) -> Vec<WorkerGuard> {
    let (non_blocking_appender, guard_stderr) = tracing_appender::non_blocking(std::io::stderr());
    let stderr_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_appender)
        .with_filter(config.rust_log);
    let mut guards = vec![guard_stderr];

    let file_subscriber = config.log_dir.as_ref().map(|dir| {
        let (file_appender, guard_file) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "feeder.log"));
        guards.push(guard_file);
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender)
            .with_filter(config.rust_log)
    });

    tracing_subscriber::registry()
        .with(stderr_subscriber)
        .with(file_subscriber)
        .init();
    guards
}

async fn log_metrics(
    metrics: SharedMetrics,
    every: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(every);
    // the first tick completes immediately
    interval.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            _ = interval.tick() => info!("{}", metrics.snapshot()),
        }
    }
}
