use clap::{Parser, Subcommand};
use stockpilot::config::Config;
use stockpilot::{logging, runtime};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "stockpilot", version = VERSION, about = "Conversational assistant core for inventory systems")]
struct Cli {
    #[command(subcommand)]
    command: Option<MainCommand>,
}

#[derive(Debug, Subcommand)]
enum MainCommand {
    /// Start the runtime (web server, workers)
    Start,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(MainCommand::Start) {
        MainCommand::Version => {
            println!("stockpilot {VERSION}");
            Ok(())
        }
        MainCommand::Start => {
            logging::init_console_logging();
            let config = Config::load()?;
            info!("stockpilot {VERSION} starting");
            runtime::run(config).await
        }
    }
}
