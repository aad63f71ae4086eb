use std::path::PathBuf;
use std::str::FromStr;

use anyhow::anyhow;
use clap::Parser;
use dotenv::dotenv;
use tracing::Level;

use concierge::config::ConfigLoader;

#[derive(Parser)]
#[command(name = "concierge", about = "Signed-request gateway for the room concierge")]
struct Args {
    /// Settings file; environment variables are used when it does not exist
    #[arg(long, default_value = "./config.toml")]
    config: PathBuf,

    /// Print the supported environment variables and exit
    #[arg(long)]
    env_help: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.env_help {
        ConfigLoader::print_help();
        return Ok(());
    }

    dotenv().ok();

    let settings = if args.config.exists() {
        ConfigLoader::from_file(&args.config).await?
    } else {
        ConfigLoader::load()?
    };
    ConfigLoader::validate(&settings)?;

    tracing_subscriber::fmt()
        .with_max_level(
            Level::from_str(&settings.log_level)
                .map_err(|_| anyhow!("Invalid log level: {}", settings.log_level))?,
        )
        .with_level(true)
        .with_thread_names(true)
        .with_target(true)
        .init();

    concierge::concierge::run(settings.concierge).await
}
