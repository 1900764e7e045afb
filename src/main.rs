use clap::Parser;

use resource_downloader::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
    }

    if let Err(e) = cli::dispatch(&cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
