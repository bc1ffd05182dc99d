use std::sync::Arc;

use clap::Parser;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dquota::cli;
use dquota::persistence::{Flusher, JsonFileFlusher, MemoryFlusher};
use dquota::transport::MemoryBus;
use dquota::{GCounter, LogErrorHandler, Metadata, QuotaEngine, QuotaStatus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dquota=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse args and env vars
    let args = cli::Cli::parse();
    args.validate()?;
    let transport_settings = args.transport_settings();

    let flusher: Arc<dyn Flusher<GCounter>> = match &args.flush_path {
        Some(path) => Arc::new(JsonFileFlusher::new(path)),
        None => Arc::new(MemoryFlusher::<GCounter>::new()),
    };

    // Every simulated node shares one in-process bus
    let bus = MemoryBus::new();
    let mut engines: Vec<QuotaEngine> = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let engine: QuotaEngine =
            QuotaEngine::new(args.into_settings(i), flusher.clone(), LogErrorHandler);
        engine.bind_transport(
            Arc::new(bus.client()),
            transport_settings.broadcast_interval,
            transport_settings.topic.clone(),
        );
        engine.start().await?;
        engines.push(engine);
    }
    info!(
        "Started {} nodes on topic '{}'",
        engines.len(),
        transport_settings.topic
    );

    // Let a couple of broadcast rounds pass so every node knows its peers
    time::sleep(transport_settings.broadcast_interval * 2).await;

    for engine in &engines {
        engine.initialize_quota_distributed(
            args.quota_max,
            args.initial_value,
            &args.quota_id,
            Metadata::new(),
        )?;
    }

    let pause = transport_settings.broadcast_interval / 4;
    let mut request = 0usize;
    loop {
        let engine = &engines[request % engines.len()];
        let status = engine.increment_by(&args.quota_id, args.increments)?;
        info!(
            "[{}] request {} on '{}': {} (used {}/{})",
            engine.node_name(),
            request,
            args.quota_id,
            status,
            engine.used(&args.quota_id)?.unwrap_or_default(),
            args.quota_max
        );
        match status {
            QuotaStatus::Ok => {}
            QuotaStatus::Violated => break,
            QuotaStatus::NotFound => {
                warn!("Quota '{}' disappeared", args.quota_id);
                break;
            }
        }
        request += 1;
        time::sleep(pause).await;
    }

    if let Some(leader) = engines.iter().find(|engine| engine.is_leader()) {
        flusher
            .flush(&leader.snapshot()?)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        info!("[{}] Final flush complete", leader.node_name());
    }

    for engine in &engines {
        engine.stop();
    }
    Ok(())
}
