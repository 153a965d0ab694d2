use redshift_config::shared::{StagingConfig, TargetConfig};
use redshift_loader::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use redshift_loader::context::EngineContext;
use redshift_loader::engine::{Engine, RunSummary};
use redshift_loader::staging::ObjectStoreStagingClient;
use redshift_loader::warehouse::{PgSqlClient, RedshiftWarehouse};
use tokio::io::BufReader;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use crate::error::TargetResult;

/// Runs the target over stdin, writing released checkpoints to stdout.
pub async fn start_target(config: TargetConfig) -> TargetResult<RunSummary> {
    config.validate()?;

    match &config.staging {
        StagingConfig::S3 { bucket, region, .. } => {
            info!(%bucket, %region, "staging batches in s3")
        }
        StagingConfig::Local { path } => {
            info!(path = %path.display(), "staging batches in a local directory")
        }
    }

    let staging = ObjectStoreStagingClient::from_config(&config.staging)?;
    let client = PgSqlClient::connect_lazy(&config.warehouse);
    client.ping().await?;
    info!(
        host = %config.warehouse.host,
        database = %config.warehouse.name,
        "connected to warehouse"
    );

    let warehouse = RedshiftWarehouse::new(client, &config.staging, &config.loader.copy_options)?;
    let ctx = EngineContext::new(config.loader, warehouse, staging);

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let signals = tokio::spawn(listen_for_signals(shutdown_tx));

    let engine = Engine::new(ctx, shutdown_rx);
    let input = BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();
    let result = engine.run(input, &mut output).await;

    signals.abort();

    result.map_err(Into::into)
}

/// Requests a graceful shutdown on SIGTERM or SIGINT.
async fn listen_for_signals(shutdown_tx: ShutdownTx) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!(error = %err, "failed to register the SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("sigint (ctrl+c) received, shutting down");
        }
        _ = sigterm.recv() => {
            info!("sigterm received, shutting down");
        }
    }

    shutdown_tx.shutdown();
}
