use clap::Parser;
use lagoon_lib::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let daemon = match lagoon_lib::run(&cli) {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("lagoond: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("lagoond: failed to listen for Ctrl-C: {e}");
    }
    daemon.shutdown().await;
}
