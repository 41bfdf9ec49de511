use std::io;
use std::process::ExitCode;

use tcshape::capture::SystemRunner;
use tcshape::config::ConfigManager;
use tcshape::interfaces::SysfsInterfaces;
use tracing::{debug, error};

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();

    // Clap reports usage errors and exits by itself
    let config = match ConfigManager::from_cli_and_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return exit_status(tcshape::exit_code(&e));
        }
    };

    if let Err(e) = config.init_logging() {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    let result = config
        .validate()
        .and_then(|_| tcshape::ensure_tools(&config))
        .and_then(|_| {
            debug!("output mode: {:?}", config.app.output);
            let probe = SysfsInterfaces::from_config(&config.shaper);
            tcshape::run(&config, &argv, SystemRunner, &probe, &mut io::stdout().lock())
        });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            exit_status(tcshape::exit_code(&e))
        }
    }
}

fn exit_status(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
