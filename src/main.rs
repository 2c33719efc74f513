//! grabby - CLI Entry Point
//!
//! Watches for removable volumes and copies their files into a local archive.
//!
//! This binary is a thin wrapper around the library, handling argument parsing,
//! logging setup, and command dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Builder;
use grabby::cli::{self, Args, DualWriter};
use grabby::core::config::Config;
use log::{info, LevelFilter};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let (mut config, config_path) = Config::load_from(args.config.as_deref())?;

    // Apply CLI overrides to config
    if let Some(ref level) = args.log_level {
        config.logging.level = level.clone();
    }

    // Set up graceful shutdown handler
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        if shutdown_flag_clone.load(Ordering::SeqCst) {
            // Second Ctrl+C - force exit
            eprintln!("\nForce shutdown requested. Exiting immediately...");
            std::process::exit(1);
        } else {
            shutdown_flag_clone.store(true, Ordering::SeqCst);
            eprintln!("\nGraceful shutdown requested. Finishing current file... (Press Ctrl+C again to force quit)");
        }
    })
    .context("Failed to set Ctrl+C handler")?;

    // Initialize logger
    let log_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);

    // The builder passes everything; the global max level does the filtering
    // so a config reload can change it.
    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Trace).format(|buf, record| {
        writeln!(
            buf,
            "[{} {} {}] {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            record.level(),
            record.target(),
            record.args()
        )
    });

    if config.logging.log_to_file {
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.log_file)
            .with_context(|| {
                format!(
                    "Failed to open log file {}",
                    config.logging.log_file.display()
                )
            })?;

        builder.target(env_logger::Target::Pipe(Box::new(DualWriter {
            console: std::io::stderr(),
            file: log_file,
        })));
    }
    builder.init();
    log::set_max_level(log_level);

    if config.logging.log_to_file {
        info!("Logging to file: {}", config.logging.log_file.display());
    }
    info!("{} v{}", grabby::NAME, grabby::VERSION);
    match &config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }

    // Run the command
    cli::run_command(&args, &config, config_path.as_deref(), shutdown_flag)?;

    Ok(())
}
