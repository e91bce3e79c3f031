// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Host Agent CLI entry point
//!
//! Runs on the hypervisor host, publishing frames and cursor state into the
//! IVSHMEM region for the guest-side viewer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, Command};
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;

use lg_host_agent::capture::pattern::PatternCapture;
use lg_host_agent::session::DefaultSessionWatcher;
use lg_host_agent::{FileShm, HostService, Result, ServiceError};

fn main() -> Result<()> {
    let matches = Command::new("lg-host-agent")
        .version("0.1.0")
        .author("lg-capture Authors")
        .about("Host agent publishing framebuffer and cursor data over IVSHMEM")
        .arg(
            Arg::new("shm-path")
                .short('s')
                .long("shm-path")
                .value_name("PATH")
                .default_value("/dev/shm/lg-host")
                .help("Path to the shared memory device"),
        )
        .arg(
            Arg::new("fps")
                .short('f')
                .long("fps")
                .value_name("FPS")
                .default_value("60")
                .help("Target capture ticks per second"),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .value_name("PIXELS")
                .default_value("1920")
                .help("Capture width"),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .value_name("PIXELS")
                .default_value("1080")
                .help("Capture height"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        .map_err(ServiceError::Io)?;

    let fps: u64 = parse_arg(&matches, "fps")?;
    let width: u32 = parse_arg(&matches, "width")?;
    let height: u32 = parse_arg(&matches, "height")?;
    let shm_path = matches.get_one::<String>("shm-path").unwrap();

    info!("Starting lg-host-agent on {}", shm_path);

    let shm = Box::new(FileShm::new(shm_path));
    let capture = Box::new(PatternCapture::new(width, height));
    let session = Box::new(DefaultSessionWatcher::default());

    let mut service = HostService::initialize(shm, capture, session)?;

    // Graceful shutdown on Ctrl+C
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    .map_err(ServiceError::Io)?;

    let tick_interval = Duration::from_micros(1_000_000 / fps.max(1));
    let mut last_tick = std::time::Instant::now();

    info!("Host agent running, press Ctrl+C to stop");

    while running.load(Ordering::SeqCst) {
        if let Err(e) = service.process() {
            error!("Capture tick failed: {}", e);
            break;
        }

        // Maintain the tick rate
        let elapsed = last_tick.elapsed();
        if elapsed < tick_interval {
            std::thread::sleep(tick_interval - elapsed);
        }
        last_tick = std::time::Instant::now();
    }

    info!("Stopping host agent...");
    service.deinitialize();

    Ok(())
}

fn parse_arg<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    matches
        .get_one::<String>(name)
        .unwrap()
        .parse()
        .map_err(|e: T::Err| {
            ServiceError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid value for --{}: {}", name, e),
            ))
        })
}
