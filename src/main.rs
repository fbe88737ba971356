mod accuracy;
mod config;
mod decoder;
mod dedup;
mod error;
mod forecast;
mod forecast_writer;
mod orchestrator;
mod pipeline;
mod scan;
mod store;

use crate::config::Config;
use crate::error::AppError;
use crate::orchestrator::Orchestrator;
use crate::pipeline::SensorPipeline;
use crate::store::StoreClient;
use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,ruuvi_sidecar=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "ruuvi-sidecar"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    tracing::info!("ruuvi-sidecar starting");

    let store = Arc::new(StoreClient::new(
        config.store_endpoint.clone(),
        config.store_token.clone(),
        config.store_org.clone(),
        config.batch_size,
        config.max_buffer_size,
        config.retry_attempts,
        config.retry_delay(),
        config.retry_base,
    ));

    let pipeline = Arc::new(SensorPipeline::new(&config, store.clone()));
    let mut pipeline_handle = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run().await })
    };

    let orchestrator = Arc::new(Orchestrator::new(config.clone(), store.clone()));
    let orchestrator_shutdown = orchestrator.shutdown_handle();
    let orchestrator_reload = orchestrator.reload_handle();
    let orchestrator_handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    let mut fatal = false;
    tokio::select! {
        _ = wait_for_shutdown_signal(orchestrator_reload) => {
            tracing::info!("shutdown requested, draining pipeline and orchestrator");
        }
        result = &mut pipeline_handle => {
            fatal = handle_pipeline_exit(result);
        }
    }

    pipeline.request_stop();
    orchestrator_shutdown.store(true, Ordering::SeqCst);

    if !pipeline_handle.is_finished() {
        let result = pipeline_handle.await;
        fatal |= handle_pipeline_exit(result);
    }
    let _ = orchestrator_handle.await;

    tracing::info!("ruuvi-sidecar stopped");
    if fatal {
        std::process::exit(1);
    }
    Ok(())
}

/// Logs the sensor pipeline's exit and reports whether it ended for a
/// process-fatal reason (a permanent store rejection or invalid config).
/// `AdapterUnavailable` only ends the pipeline task: the orchestrator's
/// forecast side is unaffected and the process keeps running.
fn handle_pipeline_exit(result: Result<Result<(), AppError>, tokio::task::JoinError>) -> bool {
    match result {
        Ok(Ok(())) => false,
        Ok(Err(err)) if err.is_fatal() => {
            tracing::error!(error = %err, "fatal pipeline error, stopping process");
            true
        }
        Ok(Err(err)) => {
            tracing::error!(error = %err, "sensor pipeline task ended");
            false
        }
        Err(join_err) => {
            tracing::error!(error = %join_err, "sensor pipeline task panicked");
            false
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal(reload: Arc<std::sync::atomic::AtomicBool>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sighup = signal(SignalKind::hangup()).expect("install SIGHUP handler");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
                return;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
                return;
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, requesting config reload");
                reload.store(true, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal(_reload: Arc<std::sync::atomic::AtomicBool>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received ctrl_c");
}
