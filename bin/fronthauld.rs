//! Fronthaul tunnel server binary

mod common;

use std::process::ExitCode;

use clap::{Arg, ArgAction, Command};
use log::{error, info};
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

use fronthaul_service::{run, Config};

fn main() -> ExitCode {
    let matches = Command::new("fronthauld")
        .version(env!("CARGO_PKG_VERSION"))
        .about("fronthaul circumvention tunnel server")
        .arg(
            Arg::new("CONFIG")
                .short('c')
                .long("config")
                .value_name("FILE")
                .required(true)
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("VERBOSE")
                .short('v')
                .action(ArgAction::Count)
                .help("Increases logging verbosity"),
        )
        .arg(
            Arg::new("LOG_WITHOUT_TIME")
                .long("log-without-time")
                .action(ArgAction::SetTrue)
                .help("Omits timestamps from log output"),
        )
        .get_matches();

    common::logging::init(
        "fronthauld",
        matches.get_count("VERBOSE"),
        matches.get_flag("LOG_WITHOUT_TIME"),
    );

    let config_path = matches.get_one::<String>("CONFIG").expect("CONFIG is required");
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("loading configuration failed, error: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("creating runtime failed, error: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        let shutdown = CancellationToken::new();

        let signal_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                signal_shutdown.cancel();
            }
        });

        run(config, shutdown).await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("server failed, error: {}", err);
            ExitCode::FAILURE
        }
    }
}
