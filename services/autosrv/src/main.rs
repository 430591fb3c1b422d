use autosrv::config::Config;
use autosrv::engine::{Engine, Ingress, MqttSink};
use autosrv::error::{AutosrvError, Result};
use autosrv::index::DeviceRuleIndex;
use autosrv::repository::{PgRepository, Repository};
use autosrv::taskqueue::{Task, TaskQueue};
use clap::{Parser, Subcommand};
use hearth_rtdb::{RedisRtdb, Rtdb, SystemTimeProvider};
use rumqttc::{AsyncClient, EventLoop, MqttOptions};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the automation engine
    Service,

    /// Rebuild the device→rule index and exit
    Reindex,

    /// Enqueue an immediate evaluation of one rule
    Trigger {
        /// Rule ID to evaluate
        rule_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting {}", config.service.name);

    match args.command {
        Some(Commands::Service) | None => run_service(&config).await,
        Some(Commands::Reindex) => reindex(&config).await,
        Some(Commands::Trigger { rule_id }) => trigger(&config, &rule_id).await,
    }
}

/// Client construction is fatal at startup: a process that cannot reach its
/// stores has nothing useful to do.
async fn connect_stores(config: &Config) -> Result<(Arc<dyn Rtdb>, Arc<dyn Repository>)> {
    let rtdb: Arc<dyn Rtdb> =
        Arc::new(RedisRtdb::new(&config.redis.url).map_err(AutosrvError::InternalError)?);
    info!("Connected to realtime store at {}", config.redis.url);

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    info!("Connected to relational store");

    Ok((rtdb, Arc::new(PgRepository::new(pool))))
}

fn connect_broker(config: &Config) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(
        &config.mqtt.client_id,
        &config.mqtt.host,
        config.mqtt.port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (&config.mqtt.username, &config.mqtt.password) {
        options.set_credentials(username, password);
    }
    AsyncClient::new(options, 64)
}

async fn run_service(config: &Config) -> Result<()> {
    let (rtdb, repo) = connect_stores(config).await?;
    let (client, event_loop) = connect_broker(config);

    let engine = Engine::new(
        Arc::clone(&rtdb),
        repo,
        Arc::new(MqttSink::new(client.clone())),
        Arc::new(SystemTimeProvider),
        config.engine.clone(),
    );
    engine.start().await?;
    engine.spawn_ingress(Ingress::new(
        client.clone(),
        event_loop,
        Arc::clone(&rtdb),
        config.engine.stream_max_len,
    ));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| AutosrvError::InternalError(e.into()))?;
    info!("Shutdown signal received");

    engine.shutdown().await;
    if let Err(e) = client.disconnect().await {
        tracing::warn!("Broker disconnect failed: {e}");
    }
    Ok(())
}

async fn reindex(config: &Config) -> Result<()> {
    let (rtdb, repo) = connect_stores(config).await?;
    DeviceRuleIndex::new(rtdb, repo).populate().await?;
    info!("Device-rule index rebuilt");
    Ok(())
}

async fn trigger(config: &Config, rule_id: &str) -> Result<()> {
    let (rtdb, _repo) = connect_stores(config).await?;
    let queue = TaskQueue::new(rtdb, &config.engine);
    queue.enqueue(Task::evaluate_rule(rule_id, "")).await?;
    info!("Enqueued evaluation for rule {rule_id}");
    Ok(())
}
