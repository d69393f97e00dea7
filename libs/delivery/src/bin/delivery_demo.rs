//! Reliable delivery demo - one producer and one consumer controller in-process
//!
//! Usage:
//!   delivery_demo --jobs 1000
//!   delivery_demo --config config/delivery.toml --environment development
//!   delivery_demo --journal /tmp/demo.journal
//!
//! With `--journal` the producer side is durable: jobs produced but not
//! confirmed when the process dies are delivered again on the next run.

use anyhow::{Context, Result};
use clap::Parser;
use delivery_actors::{ActorSystem, Recipient};
use delivery_config::DeliveryConfig;
use reliable_delivery::{
    supervision_strategy, ConsumerCommand, ConsumerController, ConsumerControllerSettings, Delivery,
    JournalDurableQueue, ProducerCommand, ProducerController, ProducerControllerSettings, RequestNext,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "delivery_demo")]
#[command(about = "Push jobs through a producer and consumer controller pair")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment whose override file is layered on top
    #[arg(short, long)]
    environment: Option<String>,

    /// Number of jobs to produce
    #[arg(short, long, default_value_t = 100)]
    jobs: u64,

    /// Journal file backing the durable producer queue
    #[arg(long)]
    journal: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = DeliveryConfig::load(args.config.as_deref(), args.environment.as_deref())?;
    let system = ActorSystem::with_supervision("delivery-demo", supervision_strategy(&config.supervision));

    let mut producer_controller =
        ProducerController::new("demo-producer", ProducerControllerSettings::from_config(&config));
    if let Some(path) = &args.journal {
        let queue = JournalDurableQueue::<String>::open(path)
            .with_context(|| format!("Failed to open journal {}", path.display()))?;
        info!(journal = %path.display(), unconfirmed = queue.unconfirmed().len(), "Using durable journal");
        producer_controller = producer_controller.with_durable_queue(Arc::new(queue));
    }

    let (request_tx, mut requests) = mpsc::unbounded_channel::<RequestNext<String>>();
    let (delivery_tx, mut deliveries) = mpsc::unbounded_channel::<Delivery<String>>();

    let pc = producer_controller.spawn(&system);
    let cc = ConsumerController::new(ConsumerControllerSettings::from_config(&config))
        .spawn(&system, "demo-consumer-controller");
    cc.tell(ConsumerCommand::Start {
        delivery_to: Recipient::from_channel(delivery_tx),
    });
    pc.tell(ProducerCommand::Start {
        producer: Recipient::from_channel(request_tx),
    });
    cc.tell(ConsumerCommand::RegisterToProducerController {
        producer_controller: pc.recipient(),
    });

    let jobs = args.jobs;
    let producer = tokio::spawn(async move {
        let mut produced = 0;
        while produced < jobs {
            let Some(next) = requests.recv().await else {
                break;
            };
            produced += 1;
            if !next.send(format!("job-{}", produced)) {
                warn!(produced, "Producer controller stopped accepting jobs");
                break;
            }
        }
        produced
    });

    let started = Instant::now();
    let mut consumed = 0u64;
    while consumed < jobs {
        let delivery = tokio::time::timeout(Duration::from_secs(30), deliveries.recv())
            .await
            .context("Timed out waiting for a delivery")?
            .context("Consumer controller stopped")?;
        debug!(seq_nr = %delivery.seq_nr, message = %delivery.message, "Consumed");
        delivery.confirm();
        consumed += 1;
    }

    let produced = producer.await?;
    info!(
        produced,
        consumed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Demo finished"
    );
    info!(stats = ?system.metrics().snapshot(), "Actor system stats");

    system.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
