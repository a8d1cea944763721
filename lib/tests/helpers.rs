// Copyright (c) 2024-2025 The Keyfort Developers

//! Shared setup for simulator backed integration tests

use std::str::FromStr;

use log::LevelFilter;
use simplelog::SimpleLogger;

use keyfort_sim::{SimDevice, SimOptions};

/// Initialise logging and build a simulated device with the provided options
pub fn device(options: SimOptions) -> SimDevice {
    init_logging();

    SimDevice::new(options).expect("simulator setup failed")
}

/// Build a simulated device with default options (standard recovery
/// phrase, current firmware, a user who approves everything)
#[allow(unused)]
pub fn default_device() -> SimDevice {
    device(SimOptions::default())
}

fn init_logging() {
    let log_level = match std::env::var("LOG_LEVEL").map(|v| LevelFilter::from_str(&v)) {
        Ok(Ok(l)) => l,
        _ => LevelFilter::Debug,
    };

    let log_config = simplelog::ConfigBuilder::new().build();
    let _ = SimpleLogger::init(log_level, log_config);
}
