// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use alert_relay::{
    aggregator::AggregationStore,
    config::AppConfig,
    delivery::DeliveryWorker,
    digest::{Digest, HtmlDigestRenderer, STARTUP_MESSAGE},
    filter::AlertFilter,
    flusher::FlushScheduler,
    ingest::IngestWorker,
    queue,
    server::{EndpointSettings, WebhookServer},
    stats::{PipelineStats, StatsReporter, StatsSource},
    telegram::TelegramTransport,
    tls,
};

mod logging;

const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";
const FALLBACK_LOG_LEVEL: &str = "info";

#[tokio::main]
pub async fn main() {
    let config_path: Option<PathBuf> = env::args()
        .nth(1)
        .or_else(|| env::var(CONFIG_PATH_ENV).ok())
        .map(PathBuf::from);

    let config = match AppConfig::load(config_path.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            logging::init(FALLBACK_LOG_LEVEL, None);
            error!("{e}");
            return;
        }
    };
    let _log_guard = match logging::rolling_appender(&config.logging) {
        Ok(appender) => logging::init(&config.logging.level, appender),
        Err(e) => {
            logging::init(&config.logging.level, None);
            error!("Unable to open log file {}: {e}", config.logging.file);
            return;
        }
    };
    debug!("Logging subsystem enabled");

    let acceptor =
        match tls::load_acceptor(&config.server.tls_certfile, &config.server.tls_keyfile) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                error!("{e}");
                return;
            }
        };

    let cancel_token = CancellationToken::new();
    let stats = Arc::new(PipelineStats::default());
    let store = Arc::new(AggregationStore::new());
    let (event_tx, event_rx) = queue::unbounded();
    let (digest_tx, digest_rx) = queue::unbounded();
    let stats_source = StatsSource::new(
        Arc::clone(&stats),
        Arc::clone(&store),
        event_tx.depth_gauge(),
        digest_tx.depth_gauge(),
    );

    let listener =
        match WebhookServer::bind(&config.server.host, config.server.port).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    "Failed to bind {}:{}: {e}",
                    config.server.host, config.server.port
                );
                return;
            }
        };

    let ingest = IngestWorker::new(
        Arc::clone(&store),
        AlertFilter::new(&config.alert),
        Arc::clone(&stats),
    );
    let ingest_handle = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move { ingest.run(event_rx, cancel_token).await })
    };

    let scheduler = FlushScheduler::new(
        Arc::clone(&store),
        Arc::new(HtmlDigestRenderer::new(&config.alert)),
        digest_tx.clone(),
        config.alert.flush_policy(),
        config.flush_check_interval(),
        Arc::clone(&stats),
    );
    let flush_handle = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move { scheduler.run(cancel_token).await })
    };

    let mut delivery = DeliveryWorker::new(
        Arc::new(TelegramTransport::new(&config.telegram)),
        config.delivery.policy(),
        Arc::clone(&stats),
    );
    let delivery_handle = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move { delivery.run(digest_rx, cancel_token).await })
    };

    let reporter = StatsReporter::new(stats_source.clone(), config.stats_interval());
    let stats_handle = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move { reporter.run(cancel_token).await })
    };

    if digest_tx.send(Digest::new(STARTUP_MESSAGE)).is_err() {
        error!("Failed to queue startup message");
    }

    let server = Arc::new(WebhookServer::new(
        EndpointSettings::from(config.as_ref()),
        event_tx,
        Arc::clone(&stats),
        stats_source,
    ));
    let mut server_handle =
        tokio::spawn(server.serve(listener, Some(acceptor), cancel_token.clone()));
    info!(
        "Alert relay listening on https://{}:{}{}",
        config.server.host, config.server.port, config.webhook.url_path
    );

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {e}");
            }
            info!("Shutdown signal received");
        }
        result = &mut server_handle => {
            error!("Webhook server stopped unexpectedly: {:?}", result);
        }
    }

    cancel_token.cancel();
    for (name, handle) in [
        ("ingest", ingest_handle),
        ("flush", flush_handle),
        ("delivery", delivery_handle),
        ("stats", stats_handle),
    ] {
        if let Err(e) = handle.await {
            error!("{name} task failed: {e}");
        }
    }
    if !server_handle.is_finished() {
        let _ = server_handle.await;
    }
    info!("Alert relay stopped");
}
