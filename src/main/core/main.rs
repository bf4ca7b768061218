use std::ffi::OsString;

use anyhow::Context;
use clap::Parser;
use nix::sys::signal;

use crate::core::configuration::{CliOptions, ConfigFileOptions, ConfigOptions};
use crate::core::controller::{self, Controller};
use crate::core::logger::emu_logger;

/// Main entry point for the emulator.
pub fn run_emulator(args: Vec<OsString>) -> anyhow::Result<()> {
    // unblock all signals since some launchers (e.g. cmake's ctest) block SIGTERM
    signal::sigprocmask(
        signal::SigmaskHow::SIG_SETMASK,
        Some(&signal::SigSet::empty()),
        None,
    )?;

    // parse the options from the command line
    let options = match CliOptions::try_parse_from(args.clone()) {
        Ok(x) => x,
        Err(e) => {
            if e.use_stderr() {
                eprint!("{}", e);
                std::process::exit(1);
            } else {
                print!("{}", e);
                std::process::exit(0);
            }
        }
    };

    // read from stdin if the config filename is given as '-'
    let config_filename: String = match options.config.as_str() {
        "-" => "/dev/stdin",
        x => x,
    }
    .into();

    // load the configuration yaml
    let file = std::fs::File::open(&config_filename)
        .with_context(|| format!("Could not open config file {:?}", &config_filename))?;
    let config_file: ConfigFileOptions = serde_yaml::from_reader(file)
        .with_context(|| format!("Could not parse configuration file {:?}", &config_filename))?;

    // generate the final configuration from the config file and cli options
    let config = ConfigOptions::new(config_file, options.clone());

    if options.show_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    // disable log buffering during startup so that we see every message immediately in the
    // terminal
    emu_logger::init(config.log_level(), true)
        .map_err(|e| anyhow::anyhow!("Could not initialize the logger: {e}"))?;
    emu_logger::set_buffering_enabled(false);

    // check if some log levels have been compiled out
    if config.log_level() > log::STATIC_MAX_LEVEL {
        log::warn!(
            "Log level set to {}, but messages higher than {} have been compiled out",
            config.log_level(),
            log::STATIC_MAX_LEVEL,
        );
    }

    log_environment(&args);

    let stop = controller::install_stop_flag()?;
    let controller = Controller::new(&config)?;

    log::debug!("Startup checks passed, we are ready to start the emulation");
    emu_logger::set_buffering_enabled(true);

    controller.run(&stop)
}

fn log_environment(args: &[OsString]) {
    for arg in args {
        log::info!("arg: {}", arg.to_string_lossy());
    }

    for (key, value) in std::env::vars_os() {
        let level = match key.to_string_lossy().as_ref() {
            "RUST_BACKTRACE" | "RUST_LOG" => log::Level::Info,
            _ => log::Level::Trace,
        };
        log::log!(level, "env: {:?}={:?}", key, value);
    }
}
