use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leaderboard_pipeline::admission::Admission;
use leaderboard_pipeline::broker::{MemoryTopic, TopicWriter};
use leaderboard_pipeline::config::Config;
use leaderboard_pipeline::constants::worker_group;
use leaderboard_pipeline::consumer::Consumer;
use leaderboard_pipeline::event::ScoreSubmission;
use leaderboard_pipeline::logging;
use leaderboard_pipeline::metrics;
use leaderboard_pipeline::publisher::AsyncPublisher;
use leaderboard_pipeline::ranking::{Leaderboard, RankingEntry, RankingReader};
use leaderboard_pipeline::rate_limiter::{Limits, RateLimiter};
use leaderboard_pipeline::server::{self, AppState};
use leaderboard_pipeline::sink::{
    self, AggregatorSink, DurableSink, MemorySortedSet, SinkKind, SqliteSortedSet, StorageSink,
};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "leaderboard-pipeline")]
#[command(about = "Score ingestion, publishing and leaderboard workers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP ingestion edge and its publisher
    Serve {
        /// Also serve leaderboard reads from the aggregator store
        #[arg(long)]
        with_ranking: bool,
        /// Prometheus exporter address, overriding server.metrics_addr
        #[arg(long)]
        metrics_addr: Option<String>,
    },
    /// Run a consumer bound to one storage sink
    Worker {
        #[arg(long, value_enum)]
        sink: Option<SinkKind>,
        /// Prometheus exporter address, overriding the sink's configured one
        #[arg(long)]
        metrics_addr: Option<String>,
    },
    /// Print the top of a leaderboard
    Top {
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        n: Option<usize>,
    },
    /// Print one user's total and rank
    Rank {
        user_id: String,
        #[arg(long)]
        mode: Option<String>,
    },
    /// Run the whole pipeline in-process against a memory topic
    Simulate {
        #[arg(long, default_value_t = 10)]
        users: u64,
        /// Submissions per user
        #[arg(long, default_value_t = 5)]
        events: u32,
    },
}

fn spawn_signal_handler(shutdown: broadcast::Sender<()>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown.send(());
    });
}

fn print_entries(mode: &str, entries: &[RankingEntry]) {
    println!("\n🏆 Leaderboard ({mode}):");
    if entries.is_empty() {
        println!("   (no scores yet)");
    }
    for entry in entries {
        println!("   #{:<3} user {:<10} {:>10.0}", entry.rank, entry.user_id, entry.score);
    }
}

async fn run_serve(config: Config, with_ranking: bool, metrics_addr: Option<String>) -> Result<()> {
    let metrics_addr = metrics_addr.unwrap_or_else(|| config.server.metrics_addr.clone());
    metrics::init_metrics(Some(&metrics_addr));
    let (shutdown_tx, _) = broadcast::channel(1);
    spawn_signal_handler(shutdown_tx.clone());

    let topic = config.open_topic().context("opening topic")?;
    info!(log = %topic.log_path().display(), "publishing to file topic");
    let writer: Arc<dyn TopicWriter> = Arc::new(topic);
    let (publisher, delivery) =
        AsyncPublisher::start(writer, &config.publisher, shutdown_tx.subscribe());

    let limiter = Arc::new(RateLimiter::new(Limits::from(&config.rate_limit)));
    let mut state = AppState::new(Admission::new(limiter, publisher.clone()), config.ranking.clone());
    if with_ranking {
        let store = SqliteSortedSet::open(config.leaderboard_db_path())?;
        state = state.with_ranking(Arc::new(Leaderboard::new(Arc::new(store))));
    }

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid server.bind '{}'", config.server.bind))?;
    server::serve(addr, state, shutdown_tx.subscribe()).await?;

    // serve returns on shutdown; make sure the delivery loop sees it too
    let _ = shutdown_tx.send(());
    if let Err(e) = delivery.await {
        warn!("Publisher task ended abnormally: {}", e);
    }
    let stats = publisher.stats();
    info!(
        enqueued = stats.enqueued,
        delivered = stats.delivered,
        dropped = stats.dropped,
        delivery_errors = stats.delivery_errors,
        "publisher stopped"
    );
    Ok(())
}

async fn run_worker(
    mut config: Config,
    sink_kind: Option<SinkKind>,
    metrics_addr: Option<String>,
) -> Result<()> {
    if let Some(kind) = sink_kind {
        config.sink.kind = kind;
    }
    let metrics_addr =
        metrics_addr.unwrap_or_else(|| config.worker_metrics_addr(config.sink.kind).to_string());
    metrics::init_metrics(Some(&metrics_addr));
    let (shutdown_tx, _) = broadcast::channel(1);
    spawn_signal_handler(shutdown_tx.clone());

    let sink = sink::build_sink(&config)?;
    let topic = config.open_topic()?;
    let group = worker_group(config.sink.kind.as_str());
    let reader = topic.reader(&group, config.consumer.poll_interval())?;
    info!(group = %group, topic = %config.broker.topic, "worker starting");

    let consumer = Consumer::new(reader, Arc::clone(&sink), &config.consumer);
    let stats = consumer.run(shutdown_tx.subscribe()).await;
    sink.close().await;

    info!(
        processed = stats.processed,
        decode_errors = stats.decode_errors,
        write_errors = stats.write_errors,
        read_errors = stats.read_errors,
        "worker stopped"
    );
    Ok(())
}

async fn run_top(config: Config, mode: Option<String>, n: Option<usize>) -> Result<()> {
    let store = SqliteSortedSet::open(config.leaderboard_db_path())?;
    let board = Leaderboard::new(Arc::new(store));
    let mode = mode.unwrap_or(config.ranking.default_mode);
    let entries = board.top_n(&mode, n.unwrap_or(config.ranking.top_n)).await?;
    print_entries(&mode, &entries);
    Ok(())
}

async fn run_rank(config: Config, user_id: String, mode: Option<String>) -> Result<()> {
    let store = SqliteSortedSet::open(config.leaderboard_db_path())?;
    let board = Leaderboard::new(Arc::new(store));
    let mode = mode.unwrap_or(config.ranking.default_mode);
    match board.rank_of(&mode, &user_id).await? {
        Some(entry) => println!(
            "user {} is #{} in {} with {:.0}",
            entry.user_id, entry.rank, mode, entry.score
        ),
        None => println!("user {user_id} has no score in {mode}"),
    }
    Ok(())
}

async fn run_simulate(config: Config, users: u64, events: u32) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let topic = MemoryTopic::new(config.broker.topic.clone());

    let (publisher, delivery) = AsyncPublisher::start(
        Arc::clone(&topic) as Arc<dyn TopicWriter>,
        &config.publisher,
        shutdown_tx.subscribe(),
    );
    // Every simulated submission fits in its user's burst
    let limiter = Arc::new(RateLimiter::new(Limits {
        tokens_per_minute: config.rate_limit.tokens_per_minute,
        burst: events.max(1),
    }));
    let admission = Admission::new(limiter, publisher.clone());

    let durable = Arc::new(DurableSink::open_in_memory(config.sink.consistency)?);
    let aggregator = Arc::new(AggregatorSink::new(Arc::new(MemorySortedSet::new())));
    let board = aggregator.leaderboard();

    let mut workers = Vec::new();
    for sink in [
        Arc::clone(&durable) as Arc<dyn StorageSink>,
        Arc::clone(&aggregator) as Arc<dyn StorageSink>,
    ] {
        let reader = topic.reader(worker_group(sink.storage_type()), config.consumer.poll_interval());
        let consumer = Consumer::new(reader, sink, &config.consumer);
        let stats = consumer.stats();
        workers.push((stats, tokio::spawn(consumer.run(shutdown_tx.subscribe()))));
    }

    let mode = config.ranking.default_mode.clone();
    let mut admitted = 0u64;
    {
        let mut rng = rand::thread_rng();
        for _ in 0..events {
            for user in 1..=users {
                let submission = ScoreSubmission::new(rng.gen_range(0..=500), mode.clone());
                match admission.submit(user, submission) {
                    Ok(_) => admitted += 1,
                    Err(e) => warn!(user, error = %e, "submission refused"),
                }
            }
        }
    }

    // Wait for both workers to drain what the publisher delivered
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let published = publisher.stats();
        let settled = published.delivered + published.delivery_errors + published.dropped;
        let drained = workers.iter().all(|(stats, _)| {
            let s = stats.snapshot();
            s.processed + s.errors() >= published.delivered
        });
        if (settled >= admitted && drained) || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let _ = shutdown_tx.send(());
    let _ = delivery.await;
    for (_, handle) in workers {
        let _ = handle.await;
    }

    let published = publisher.stats();
    println!("\n📊 Simulation results:");
    println!("   Admitted:  {admitted}");
    println!("   Delivered: {}", published.delivered);
    println!("   Dropped:   {}", published.dropped);
    println!("   Stored:    {}", durable.count()?);
    let entries = board.top_n(&mode, config.ranking.top_n).await?;
    print_entries(&mode, &entries);

    durable.close().await;
    aggregator.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let service = match &cli.command {
        Commands::Serve { .. } => "serve",
        Commands::Worker { .. } => "worker",
        Commands::Top { .. } | Commands::Rank { .. } => "query",
        Commands::Simulate { .. } => "simulate",
    };
    let _guard = logging::init_logging(service);

    let config = Config::load().context("loading configuration")?;

    match cli.command {
        Commands::Serve {
            with_ranking,
            metrics_addr,
        } => run_serve(config, with_ranking, metrics_addr).await,
        Commands::Worker { sink, metrics_addr } => run_worker(config, sink, metrics_addr).await,
        Commands::Top { mode, n } => run_top(config, mode, n).await,
        Commands::Rank { user_id, mode } => run_rank(config, user_id, mode).await,
        Commands::Simulate { users, events } => run_simulate(config, users, events).await,
    }
}
