// Copyright (c) 2024-2025 The Keyfort Developers

//! Pairing integration tests against the simulator

use std::time::Duration;

use keyfort_sim::{PairingMode, SimOptions};
use keyfort_tests::pairing;

mod helpers;
use helpers::{default_device, device};

#[tokio::test(flavor = "multi_thread")]
async fn pair_accept() -> anyhow::Result<()> {
    pairing::accept(default_device()).await
}

#[tokio::test(flavor = "multi_thread")]
async fn pair_device_rejects() -> anyhow::Result<()> {
    let d = device(SimOptions {
        pairing: PairingMode::Reject,
        ..SimOptions::default()
    });

    pairing::device_rejects(d).await
}

#[tokio::test(flavor = "multi_thread")]
async fn pair_host_rejects() -> anyhow::Result<()> {
    pairing::host_rejects(default_device()).await
}

#[tokio::test(flavor = "multi_thread")]
async fn pair_confirm_deadline() -> anyhow::Result<()> {
    let d = device(SimOptions {
        pairing: PairingMode::Ignore,
        ..SimOptions::default()
    });

    pairing::confirm_deadline(d).await
}

#[tokio::test(flavor = "multi_thread")]
async fn pair_concurrent_confirm() -> anyhow::Result<()> {
    let d = device(SimOptions {
        pairing: PairingMode::Delayed(Duration::from_millis(100)),
        ..SimOptions::default()
    });

    pairing::concurrent_confirm(d).await
}

#[tokio::test(flavor = "multi_thread")]
async fn pair_preverified() -> anyhow::Result<()> {
    let d = device(SimOptions {
        preverified: true,
        ..SimOptions::default()
    });

    pairing::preverified(d).await
}

#[tokio::test(flavor = "multi_thread")]
async fn pair_restart() -> anyhow::Result<()> {
    pairing::restart(default_device()).await
}
