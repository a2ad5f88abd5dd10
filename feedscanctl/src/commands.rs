use std::sync::Arc;

use anyhow::Context;
use feedscan_core::feed::HttpFeedClient;
use feedscan_core::queue::{PostgresQueue, QueueName, QueueTransport};
use feedscan_core::runtime::Pipeline;
use feedscan_core::scan::{StartOutcome, StartScanRequest};
use feedscan_core::store::PostgresTableStore;
use feedscan_model::IndexScan;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::config::FeedscanConfig;
use crate::{ScanRef, StartArgs};

async fn connect(config: &FeedscanConfig) -> anyhow::Result<Pipeline> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections())
        .connect(config.database_url()?)
        .await
        .context("failed to connect to PostgreSQL")?;
    let pipeline_config = &config.pipeline;

    let store = PostgresTableStore::new(pool.clone(), pipeline_config.storage.max_batch_size)
        .await
        .context("table store unavailable")?;
    let queue = PostgresQueue::new(
        pool,
        pipeline_config.queue.max_message_size,
        pipeline_config.queue.max_dequeue_count,
    )
    .await
    .context("queue unavailable")?;
    let feed =
        HttpFeedClient::new(&pipeline_config.feed).context("failed to build feed client")?;

    Ok(Pipeline::new(
        pipeline_config.clone(),
        Arc::new(store),
        Arc::new(queue),
        Arc::new(feed),
    ))
}

fn describe(scan: &IndexScan) -> String {
    let bound = |b: Option<chrono::DateTime<chrono::Utc>>| {
        b.map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
    };
    format!(
        "{}  {:<13} {:<9} cursor='{}' ({}, {}]",
        scan.scan_id,
        scan.scan_type.as_str(),
        scan.state.as_str(),
        scan.cursor_name,
        bound(scan.min),
        bound(scan.max)
    )
}

pub async fn migrate(config: &FeedscanConfig) -> anyhow::Result<()> {
    let pipeline = connect(config).await?;
    pipeline
        .initialize()
        .await
        .context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

pub async fn worker(config: &FeedscanConfig) -> anyhow::Result<()> {
    let pipeline = connect(config).await?;
    pipeline.initialize().await.context("failed to initialize pipeline")?;

    let pool = pipeline.worker_pool(config.pipeline.worker.parallelism);
    pool.start().await;

    let token = pool.shutdown_token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "failed to listen for ctrl-c");
            }
            info!("interrupt received");
        }
        _ = token.cancelled() => {}
    }
    pool.shutdown().await;
    Ok(())
}

pub async fn start(config: &FeedscanConfig, args: &StartArgs) -> anyhow::Result<()> {
    let pipeline = connect(config).await?;
    let service = pipeline.service();
    let request = StartScanRequest {
        scan_type: args.scan_type,
        cursor_name: args.cursor_name(),
        min: args.min,
        max: args.max,
    };

    let scan = match service.start(request).await.context("failed to start scan")? {
        StartOutcome::Started(scan) => {
            println!("started   {}", describe(&scan));
            scan
        }
        StartOutcome::AlreadyRunning(scan) => {
            println!("running   {}", describe(&scan));
            scan
        }
        StartOutcome::UpToDate { min, max } => {
            println!("up to date (min {min} >= max {max})");
            return Ok(());
        }
        StartOutcome::Busy => {
            anyhow::bail!("another caller is starting a scan for this cursor; try again shortly")
        }
    };
    if !args.wait {
        return Ok(());
    }

    let interval = args.poll_interval();
    loop {
        let running = service
            .is_running(&scan.cursor_name, &scan.scan_id)
            .await
            .context("failed to poll scan")?;
        if !running {
            break;
        }
        tokio::time::sleep(interval).await;
    }
    println!("complete  {}", scan.scan_id);

    if !scan.cursor_name.is_empty() {
        let cursor = service
            .advance_cursor(&scan.cursor_name, &scan.scan_id)
            .await
            .context("failed to advance cursor")?;
        println!("cursor    {} -> {}", cursor.name, cursor.value.to_rfc3339());
    }
    Ok(())
}

pub async fn status(config: &FeedscanConfig, scan: &ScanRef) -> anyhow::Result<()> {
    let pipeline = connect(config).await?;
    let Some(status) = pipeline
        .service()
        .status(&scan.cursor, &scan.scan_id)
        .await?
    else {
        anyhow::bail!("no scan {} for cursor '{}'", scan.scan_id, scan.cursor);
    };

    println!("{}", describe(&status.scan));
    println!("running         {}", status.running);
    println!("pending pages   {}+", status.pending_pages);
    println!("pending leaves  {}+", status.pending_leaves);
    if let Some(started) = status.scan.started_at {
        println!("started at      {}", started.to_rfc3339());
    }
    if let Some(completed) = status.scan.completed_at {
        println!("completed at    {}", completed.to_rfc3339());
    }
    Ok(())
}

pub async fn requeue(config: &FeedscanConfig, scan: &ScanRef) -> anyhow::Result<()> {
    let pipeline = connect(config).await?;
    let summary = pipeline
        .service()
        .requeue(&scan.cursor, &scan.scan_id)
        .await
        .context("failed to requeue scan")?;
    if !summary.index {
        println!("scan {} is complete, nothing to requeue", scan.scan_id);
        return Ok(());
    }
    println!(
        "requeued {} leaves, {} pages and the index message of {}",
        summary.leaves, summary.pages, scan.scan_id
    );
    Ok(())
}

pub async fn scans(config: &FeedscanConfig, cursor: &str, limit: usize) -> anyhow::Result<()> {
    let pipeline = connect(config).await?;
    let scans = pipeline.service().latest_scans(cursor, limit.max(1)).await?;
    if scans.is_empty() {
        println!("no scans for cursor '{cursor}'");
    }
    for scan in &scans {
        println!("{}", describe(scan));
    }
    Ok(())
}

pub async fn queues(config: &FeedscanConfig) -> anyhow::Result<()> {
    let pipeline = connect(config).await?;
    for queue in [QueueName::Work, QueueName::Poison] {
        let depth = pipeline.transport().approximate_count(queue).await?;
        println!("{:<7} {depth}", queue.as_str());
    }
    Ok(())
}
