// src/main.rs

//! The main entry point for the Peridot server binary.

use std::env;
use std::process::exit;

use peridot::config::Opts;
use peridot::core::cycle::{self, BuildOptions, Cycle};
use peridot::core::errors::PeridotError;
use peridot::core::module::ModuleRegistry;
use peridot::core::pid;
use peridot::server;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    let args: Vec<String> = env::args().collect();

    let opts = match Opts::parse(args) {
        Ok(opts) => opts,
        Err(message) => {
            eprintln!("{message}");
            exit(2);
        }
    };

    if opts.show_version {
        println!("peridot version {VERSION}");
        if opts.show_build_info {
            println!("built for {}-{}", env::consts::ARCH, env::consts::OS);
        }
        return;
    }

    // Set up logging: RUST_LOG overrides; test mode stays quiet so the
    // verdict line is all the operator sees.
    let default_level = if opts.test_config { "error" } else { "info" };
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    // `-s`: learn the pid path from the configuration, deliver the signal,
    // and get out of the way.
    if let Some(signal) = &opts.signal {
        let modules = ModuleRegistry::bootstrap(Vec::new());
        let result = Cycle::bootstrap(
            modules,
            opts.prefix.clone(),
            opts.conf_file(),
            opts.directives.clone(),
        )
        .and_then(|mut init| {
            cycle::build_cycle(
                &mut init,
                &BuildOptions {
                    test_config: false,
                    signaller: true,
                },
            )
        })
        .and_then(|cycle| pid::signal_process(&cycle.core_conf().pid_path, signal));

        match result {
            Ok(()) => return,
            Err(e) => {
                eprintln!("{e}");
                exit(1);
            }
        }
    }

    let modules = ModuleRegistry::bootstrap(Vec::new());
    let test_config = opts.test_config;
    let conf_file = opts.conf_file();

    if let Err(e) = server::run(opts, modules) {
        match &e {
            PeridotError::Config { .. } => eprintln!("{e}"),
            _ => error!("{e}"),
        }
        if test_config {
            eprintln!("configuration file {} test failed", conf_file.display());
        }
        exit(2);
    }
}
