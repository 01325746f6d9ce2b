use std::{env, io, process};

use groupbuy_eng::config::EngineConfig;
use groupbuy_eng::csv::{read_commands, write_wallets};
use groupbuy_eng::script::Runner;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: groupbuy-eng <script.csv> [config.toml]");
        process::exit(2);
    };

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let config = match args.next() {
        Some(config_path) => match EngineConfig::from_toml_file(&config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %config_path, "{e}");
                process::exit(1);
            }
        },
        None => EngineConfig::default(),
    };

    // owned path: the reader moves into a spawned task
    let commands = match read_commands(path) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    let mut runner = Runner::new(config);
    let (command_sender, command_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(command) => {
                    if command_sender.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    runner.run(ReceiverStream::new(command_receiver)).await;

    let written = runner
        .wallets()
        .map_err(|e| e.to_string())
        .and_then(|wallets| write_wallets(io::stdout().lock(), &wallets).map_err(|e| e.to_string()));
    if let Err(e) = written {
        error!("{e}");
        process::exit(1);
    }
}
