mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tower::limit::ConcurrencyLimitLayer;

use dirpy::cache::Cache;
use dirpy::config::Config;
use dirpy::server::{router, AppState};
use dirpy::worker_pool;

/// DIRPY: the Dynamic Image Resizing Program, Yay!
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the Dirpy config file
    #[arg(short = 'c', long = "config-file")]
    config_file: Option<PathBuf>,

    /// Emit debug output
    #[arg(short, long)]
    debug: bool,

    /// Don't daemonize; run program in the foreground
    #[arg(short, long)]
    foreground: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config_path = cli.config_file.clone().or_else(|| {
        let default = PathBuf::from("/etc/dirpy.conf");
        default.exists().then_some(default)
    });

    let mut cfg = Config::load(config_path.as_ref())?;
    cfg.debug = cfg.debug || cli.debug;
    cfg.foreground = cli.foreground;

    init_logging(&cfg);

    if worker_pool::is_worker_process() {
        run_worker(cfg)
    } else {
        worker_pool::run_supervisor(&cfg, config_path.as_deref())?;
        Ok(())
    }
}

fn init_logging(cfg: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg.debug {
            "dirpy=debug,tower_http=info".into()
        } else {
            "dirpy=info,tower_http=info".into()
        }
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(logging::TruncatingFormatter { max_line: cfg.log_max_line });

    if cfg.foreground {
        subscriber.with_writer(std::io::stdout).init();
    } else {
        // Daemonization and log-file rotation are external concerns (see
        // SPEC_FULL.md); foreground just picks the writer.
        match std::fs::OpenOptions::new().create(true).append(true).open(&cfg.log_file) {
            Ok(file) => {
                subscriber.with_writer(std::sync::Mutex::new(file)).init();
            }
            Err(e) => {
                eprintln!("Unable to log to {} ({e}); falling back to stdout", cfg.log_file);
                subscriber.with_writer(std::io::stdout).init();
            }
        }
    }
}

fn run_worker(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let cache = Cache::connect(&cfg).await.map(tokio::sync::Mutex::new);
        let timeout = cfg.req_timeout.map(std::time::Duration::from_secs);
        let listener_std = worker_pool::bind_reuseport(&cfg.bind_addr, cfg.bind_port, timeout)?;
        let listener = tokio::net::TcpListener::from_std(listener_std)?;

        let state = Arc::new(AppState { cfg, cache });
        let app = router(state).layer(ConcurrencyLimitLayer::new(1));

        tracing::debug!("worker listening on {:?}", listener.local_addr());
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
