use std::path::PathBuf;

use clap::Parser;
use dmrelay::{config::DEFAULT_CONFIG_PATH, status, Config, Server};

#[derive(Parser)]
#[command(name = "dmrelay")]
#[command(about = "Pi-Star compatible MMDVM (home-brew repeater protocol) DMR relay server")]
#[command(version)]
struct Cli {
    /// Enable verbose packet tracing
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Query a locally running server for status and exit
    #[arg(short = 's', long = "status")]
    status: bool,

    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // the banner prints before argument parsing so --help shows it too
    println!("dmrelay - Pi-Star compatible MMDVM DMR relay server");
    println!("Version {}\n", dmrelay::VERSION);

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if cli.debug {
        config.debug.level = 1;
    }

    let default_filter = if config.debug.level > 0 { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if cli.status {
        match status::query(config.general.udp_port).await {
            Ok(dump) => {
                println!("{}", dump);
                return Ok(());
            }
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    }

    let server = Server::bind(config).await?;
    server.run().await?;

    Ok(())
}
