use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use price_tracker::config;
use price_tracker::service::PriceWatch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    info!("Starting price tracker");

    let config = config::load_from_env()?;
    let watch = PriceWatch::new(&config).await?;

    // Drain whatever is already waiting before the first tick
    if let Err(e) = watch.run_pass().await {
        error!("Error during initial pass: {}", e);
    }

    let sched = JobScheduler::new().await?;

    let job_watch = watch.clone();
    sched
        .add(Job::new_async(config.feed.schedule.as_str(), move |_uuid, _l| {
            let watch = job_watch.clone();
            Box::pin(async move {
                if let Err(e) = watch.run_pass().await {
                    error!("Error during ingestion pass: {}", e);
                }
            })
        })?)
        .await?;

    info!("Scheduler started ({})", config.feed.schedule);
    sched.start().await?;

    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
    }
}
