use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use mqtt_loadtest::mqtt::{MemoryBroker, RumqttFactory, TransportFactory};
use mqtt_loadtest::runner::{LoadTest, TestPlan};
use mqtt_loadtest::sampler::Role;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const CONFIG_DIR: &str = "mqtt-loadtest";
const PLAN_FILE: &str = "plan.toml";

/// Subscriber and publisher load generator for MQTT brokers
#[derive(Parser, Debug)]
#[command(name = "mqtt-loadtest", version, about)]
struct Args {
    /// TOML test plan (default: ~/.config/mqtt-loadtest/plan.toml if present)
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Broker URI, e.g. tcp://localhost:1883 or ws://host:8080/mqtt
    #[arg(long)]
    host: Option<String>,

    /// Comma separated topic list
    #[arg(long)]
    topic: Option<String>,

    /// Number of virtual users
    #[arg(long)]
    users: Option<usize>,

    /// Samples per user
    #[arg(long)]
    iterations: Option<u64>,

    #[arg(long, value_enum)]
    role: Option<Role>,

    /// Sampler parameter in KEY=VALUE form, e.g. AGGREGATE=50
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Run against an in-process broker instead of the network
    #[arg(long)]
    dry_run: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_ascii_uppercase(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup(args.verbose)?;

    let plan = build_plan(&args)?;
    info!(
        "Plan: {} {} users x {} samples against {} on {}",
        plan.users, plan.role, plan.iterations, plan.sampler.host, plan.sampler.topic
    );

    let broker = MemoryBroker::new();
    let factory: Arc<dyn TransportFactory> = if args.dry_run {
        info!("Dry run: using in-process broker");
        Arc::new(broker.clone())
    } else {
        Arc::new(RumqttFactory)
    };

    let load_test = Arc::new(LoadTest::new(plan, factory).map_err(|e| eyre!("{}", e))?);

    let interrupter = load_test.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping users");
            interrupter.interrupt().await;
        }
    });

    let feeder = CancellationToken::new();
    if args.dry_run && load_test.plan().role == Role::Subscriber {
        spawn_dry_run_feeder(broker, load_test.plan().sampler.topics(), feeder.clone());
    }

    let report = load_test.run().await;
    feeder.cancel();

    println!("{}", report);
    if report.is_success() {
        Ok(())
    } else {
        Err(eyre!(
            "{} of {} samples failed",
            report.failures() + report.setup_errors(),
            report.samples()
        ))
    }
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env(if verbose { Level::DEBUG } else { Level::INFO });
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn default_plan_path() -> Option<PathBuf> {
    let mut path = dirs::config_dir()?;
    path.push(CONFIG_DIR);
    path.push(PLAN_FILE);
    path.exists().then_some(path)
}

fn build_plan(args: &Args) -> Result<TestPlan> {
    let mut plan = match args.plan.clone().or_else(default_plan_path) {
        Some(path) => {
            info!("Loading plan from {}", path.display());
            TestPlan::load(&path).map_err(|e| eyre!("{}", e))?
        }
        None => {
            debug!("No plan file, using defaults");
            TestPlan::default()
        }
    };

    let params: HashMap<String, String> = args.params.iter().cloned().collect();
    plan.sampler
        .apply_params(&params)
        .map_err(|e| eyre!("{}", e))?;

    if let Some(host) = &args.host {
        plan.sampler.host = host.clone();
    }
    if let Some(topic) = &args.topic {
        plan.sampler.topic = topic.clone();
    }
    if let Some(users) = args.users {
        plan.users = users;
    }
    if let Some(iterations) = args.iterations {
        plan.iterations = iterations;
    }
    if let Some(role) = args.role {
        plan.role = role;
    }
    Ok(plan)
}

/// Publishes a steady trickle on every topic so dry-run subscribers have
/// something to count
fn spawn_dry_run_feeder(broker: MemoryBroker, topics: Vec<String>, stop: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(10));
        let mut sequence = 0u64;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {
                    for topic in &topics {
                        sequence += 1;
                        broker.inject(topic, format!("dry-run message {}", sequence));
                    }
                }
            }
        }
    });
}
