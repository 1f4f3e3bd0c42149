use clap::Parser as _;
use std::error::Error as _;
use tuya2mqtt::commands;

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Run(commands::run::Args),
    Devices(commands::devices::Args),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let result: Result<(), Box<dyn std::error::Error>> = match Commands::parse() {
        Commands::Run(args) => commands::run::run(args).await.map_err(Into::into),
        Commands::Devices(args) => commands::devices::run(args).await.map_err(Into::into),
    };
    std::process::exit(match result {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}
