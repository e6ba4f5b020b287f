//! Taskplan runner - Entry Point
//!
//! Reads a plan builder response from a file, executes it with echo
//! executors and prints the final snapshot as JSON. HUMAN steps are
//! answered line by line from stdin.

use std::sync::Arc;
use taskplan::{
    parse_planner_response, Config, EchoExecutor, ExecutorKind, ExecutorRegistry, HumanGateway, MemoryStore,
    PlanOrchestrator, PlanStatus, Session, SqliteStore, StaticPlanBuilder, Store, StoreBackend,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn print_help() {
    println!("Taskplan v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: taskplan --plan <file.json> [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --plan, -p <file>   Plan builder response (JSON) to execute");
    println!("  --task <text>       Task description (default: plan summary)");
    println!("  --json              Log as JSON lines on stderr");
    println!("  --help, -h          Show this help");
    println!();
    println!("Logging: RUST_LOG (e.g. info, taskplan=debug)");
    println!();
    println!("Environment variables:");
    println!("  TASKPLAN_RETRY_LIMIT          Attempts per tier (default: 3)");
    println!("  TASKPLAN_BACKOFF_BASE_MS      Initial retry delay (default: 1000)");
    println!("  TASKPLAN_BACKOFF_MULTIPLIER   Backoff multiplier (default: 2.0)");
    println!("  TASKPLAN_BACKOFF_MAX_MS       Retry delay cap (default: 10000)");
    println!("  TASKPLAN_EXECUTOR_TIMEOUT_MS  Executor timeout (default: 30000)");
    println!("  TASKPLAN_MAX_STEPS            Max steps per plan (default: 20)");
    println!("  TASKPLAN_STORE                memory | sqlite (default: memory)");
    println!("  TASKPLAN_DB_PATH              SQLite database path");
    println!("  TASKPLAN_USER_ID              User id (default: console_user)");
}

fn arg_value(args: &[String], names: &[&str]) -> Option<String> {
    args.iter()
        .position(|a| names.contains(&a.as_str()))
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let json_logs = args.iter().any(|a| a == "--json");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");
    let plan_path = arg_value(&args, &["--plan", "-p"]);

    if help_mode {
        print_help();
        return Ok(());
    }

    let Some(plan_path) = plan_path else {
        print_help();
        anyhow::bail!("--plan <file.json> is required");
    };

    // RUST_LOG accepts levels and per-module directives, default info
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries the snapshot; logs go to stderr
    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Taskplan v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let response = tokio::fs::read_to_string(&plan_path).await?;
    let proposed = parse_planner_response(&response)?;
    let task = arg_value(&args, &["--task"])
        .or_else(|| proposed.summary.clone())
        .unwrap_or_else(|| format!("Plan from {}", plan_path));
    let builder = StaticPlanBuilder::from_plan(proposed);

    let store: Arc<dyn Store> = match config.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => {
            info!("Using SQLite store at {:?}", config.db_path);
            Arc::new(SqliteStore::open(&config.db_path)?)
        }
    };

    let (gateway, mut requests) = HumanGateway::new();
    let mut registry = ExecutorRegistry::new();
    for kind in ExecutorKind::ALL {
        if kind != ExecutorKind::Human {
            registry.register(kind, Arc::new(EchoExecutor));
        }
    }
    registry.register(ExecutorKind::Human, gateway.clone());

    let orchestrator = Arc::new(
        PlanOrchestrator::new(
            Session::new(&config.user_id),
            store,
            registry,
            Arc::new(builder),
            config.orchestrator_config(),
        )
        .with_human_gateway(gateway),
    );

    let plan = orchestrator.create_plan(&task).await?;

    // Answer human requests from stdin; EOF cancels the plan
    {
        let orchestrator = Arc::clone(&orchestrator);
        let plan_id = plan.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(request) = requests.recv().await {
                eprintln!("\n[HUMAN] {}\n{}> ", request.action, request.context);
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Err(e) = orchestrator.submit_human_feedback(&request.step_id, &line).await {
                            warn!("Could not deliver feedback: {}", e);
                        }
                    }
                    _ => {
                        warn!("stdin closed, cancelling plan");
                        if let Err(e) = orchestrator.cancel_plan(&plan_id).await {
                            warn!("Could not cancel plan: {}", e);
                        }
                        break;
                    }
                }
            }
        });
    }

    // Ctrl+C requests cancellation
    {
        let orchestrator = Arc::clone(&orchestrator);
        let plan_id = plan.id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling plan");
                if let Err(e) = orchestrator.cancel_plan(&plan_id).await {
                    warn!("Could not cancel plan: {}", e);
                }
            }
        });
    }

    let finished = orchestrator.execute_plan(&plan.id).await?;
    let snapshot = orchestrator.get_plan_status(&finished.id).await?;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    if finished.status != PlanStatus::Completed {
        eprintln!("{}", snapshot.format());
        std::process::exit(1);
    }

    Ok(())
}
