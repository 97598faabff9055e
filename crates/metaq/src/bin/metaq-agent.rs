use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use metaq::agent::{AgentContext, AgentOptions, run_agent};
use metaq::backend::create_backend;
use metaq::common::config::{AgentConfig, default_config_path};
use metaq::common::setup::setup_logging;
use metaq::manifest::store::JobStore;

/// Runs jobs submitted into a shared bucket on the local batch scheduler.
#[derive(Parser)]
#[command(author, about, version(metaq::METAQ_VERSION), help_expected(true))]
struct AgentOpts {
    /// Path to the agent configuration file
    #[arg(long, value_hint = clap::ValueHint::FilePath, env = "METAQ_CONFIG")]
    config: Option<PathBuf>,

    /// Keep processing jobs periodically until interrupted
    #[arg(long)]
    daemon: bool,

    /// Agent name, overrides the name from the configuration file
    #[arg(long)]
    name: Option<String>,

    /// Enables more verbose logging
    #[arg(long, short)]
    verbose: bool,
}

fn load_config(opts: &AgentOpts) -> metaq::Result<AgentConfig> {
    let path = opts.config.clone().unwrap_or_else(default_config_path);
    let mut config = AgentConfig::load(&path)?;
    if let Some(name) = &opts.name {
        config.name = name.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn start_agent(opts: AgentOpts, config: AgentConfig) -> metaq::Result<()> {
    let backend = create_backend(config.backend_name())?;
    let store = JobStore::from_config(&config.bucket)?;
    // Fail early if the bucket cannot be reached.
    store.list_job_ids().await.map_err(|e| {
        metaq::Error::ConfigError(format!("Cannot access bucket {}: {e}", config.bucket.url))
    })?;

    let cache_dir = config.job_cache_dir();
    std::fs::create_dir_all(&cache_dir)?;

    log::info!(
        "Starting agent {} (backend {}, {} worker(s), {})",
        config.name,
        backend.name(),
        config.num_workers,
        if opts.daemon { "daemon mode" } else { "single cycle" }
    );
    let ctx = Arc::new(AgentContext::new(
        config.name.clone(),
        store,
        backend,
        cache_dir,
    ));
    run_agent(
        ctx,
        AgentOptions {
            num_workers: config.num_workers,
            daemon: opts.daemon,
            daemon_interval: config.daemon_interval(),
            log_file: Some(config.log_file()),
        },
    )
    .await
}

fn exit_with_error(error: metaq::Error) -> ! {
    log::error!("{error}");
    let _ = AgentOpts::command().print_help();
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let opts = AgentOpts::parse();

    let config = match load_config(&opts) {
        Ok(config) => config,
        Err(error) => {
            // Logging is not set up yet, the log file location comes from the configuration.
            eprintln!("{error}");
            let _ = AgentOpts::command().print_help();
            std::process::exit(1);
        }
    };
    if let Err(error) = setup_logging(opts.verbose, Some(&config.log_file())) {
        eprintln!("{error}");
        std::process::exit(1);
    }

    if let Err(error) = start_agent(opts, config).await {
        exit_with_error(error);
    }
}
