mod answer_log;
mod bus;
mod config;
mod configure;
mod console;
mod invoker;
mod ping;
mod prompts;
mod scheduler;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "pingkeeper",
    version,
    about = "Keeps an assistant CLI session warm by pinging it on a schedule"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler with an interactive console (default)
    Run {
        /// Begin idle; type `start` to arm the timer
        #[arg(long)]
        paused: bool,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Ping once, record the answer and exit
    Once {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print the last lines of the answers file
    Tail {
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
    Configure,
}

#[derive(Args, Default)]
struct Overrides {
    /// haiku, sonnet or opus
    #[arg(long)]
    model: Option<String>,
    /// Seconds between pings
    #[arg(long)]
    interval: Option<u64>,
    /// Seconds to wait for a reply
    #[arg(long)]
    timeout: Option<u64>,
}

impl Overrides {
    fn apply(self, cfg: &mut config::AppConfig) -> Result<()> {
        if let Some(model) = self.model {
            cfg.model = model.parse().map_err(|e: String| anyhow!(e))?;
        }
        if let Some(interval) = self.interval {
            cfg.interval_secs = interval;
        }
        if let Some(timeout) = self.timeout {
            cfg.timeout_secs = timeout;
        }
        cfg.validate()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run {
        paused: false,
        overrides: Overrides::default(),
    }) {
        Commands::Run { paused, overrides } => {
            let mut cfg = config::AppConfig::load()?;
            overrides.apply(&mut cfg)?;
            console::run(cfg, paused).await
        }
        Commands::Once { overrides } => {
            let mut cfg = config::AppConfig::load()?;
            overrides.apply(&mut cfg)?;
            console::run_once(cfg).await
        }
        Commands::Tail { lines } => {
            let cfg = config::AppConfig::load()?;
            console::print_tail(&cfg, lines)
        }
        Commands::Configure => configure::run(),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
