use aihive::{agents, config, cron, pool, subagent};

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // .env discovery from cwd and parents; AIHIVE_ENV_FILE overrides.
    if let Ok(path) = std::env::var("AIHIVE_ENV_FILE") {
        if !path.trim().is_empty() {
            if let Err(e) = dotenvy::from_path(&path) {
                eprintln!("Warning: failed to load AIHIVE_ENV_FILE '{}': {}", path, e);
            }
        } else {
            let _ = dotenvy::dotenv();
        }
    } else {
        let _ = dotenvy::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cfg!(feature = "browser") {
                EnvFilter::new("info,chromiumoxide=off")
            } else {
                EnvFilter::new("info")
            }
        }))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-V" => {
                println!("aihive {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("aihive {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: aihive [OPTIONS]\n");
                println!("Options:");
                println!("  -h, --help       Print help");
                println!("  -V, --version    Print version");
                println!("\nEnvironment:");
                println!("  AIHIVE_DATA_DIR  Data directory (default ./data)");
                println!("  AIHIVE_ENV_FILE  Explicit .env file path");
                return Ok(());
            }
            other => {
                eprintln!("unknown argument: {}", other);
                std::process::exit(2);
            }
        }
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let data_dir = PathBuf::from(
        std::env::var("AIHIVE_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
    );
    std::fs::create_dir_all(&data_dir)?;

    let config = config::Config::load(&data_dir.join("aihive.json"))?;
    let workspace_root = if config.workspace_root.is_empty() {
        data_dir.join("workspaces")
    } else {
        PathBuf::from(&config.workspace_root)
    };
    let config = Arc::new(RwLock::new(config));

    let agent_mgr = Arc::new(agents::Manager::new(&data_dir, &workspace_root)?);
    let pool = Arc::new(pool::Pool::new(Arc::clone(&config), Arc::clone(&agent_mgr)));

    // Subagent manager drives runs through the pool and broadcasts
    // lifecycle events to the spawning session.
    let subagent_mgr = Arc::new(subagent::Manager::new(
        pool::Pool::subagent_run_fn(Arc::clone(&pool)),
        Some(data_dir.join("subagents")),
    ));
    let broadcasters = pool.broadcasters();
    subagent_mgr.set_broadcaster(Arc::new(move |session_id, event, data| {
        broadcasters.publish(session_id, event, data);
    }));
    let agents_for_info = Arc::clone(&agent_mgr);
    subagent_mgr.set_agent_info(Arc::new(move |agent_id| {
        agents_for_info
            .get(agent_id)
            .map(|a| (a.name, a.avatar_color))
    }));
    pool.set_subagent_manager(Arc::clone(&subagent_mgr));

    // Cron engine: isolated runs via the pool; announcements land in the log
    // until a messaging channel registers a real delivery callback.
    let engine = Arc::new(cron::Engine::new(
        &data_dir,
        pool::Pool::cron_run_fn(Arc::clone(&pool)),
        Some(Arc::new(|agent_id: &str, job_name: &str, output: &str| {
            info!(agent = agent_id, job = job_name, "announce: {}", output);
        })),
    ));
    engine.load()?;

    let shutdown = CancellationToken::new();
    Arc::clone(&engine).start(shutdown.clone());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        "aihive daemon ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    Ok(())
}
