// Copyright (c) 2024-2025 The Keyfort Developers

//! Tests for Keyfort signing devices.
//!
//! Every scenario is generic over [`Transport`] so the same flows run
//! against the software simulator or real hardware. Scenarios that need a
//! scripted user decision on the device document it; the caller configures
//! the device accordingly before handing it in.

use keyfort::{DeviceLink, PairingSession, Transport};

pub mod chain;

pub mod pairing;

pub mod wallet;

pub mod transaction;

/// Recovery phrase the device under test is expected to hold
pub const MNEMONIC: &str = "boring mistake dish oyster truth pigeon viable \
     emerge sort crash wire portion cannon couple enact box walk height \
     pull today solid off enable tide";

/// Root fingerprint of the [`MNEMONIC`] seed
pub const ROOT_FINGERPRINT: &str = "4c00739d";

/// Connect and pair, confirming the channel hash on both ends
pub async fn pair<T: Transport>(t: T) -> anyhow::Result<(DeviceLink<T>, PairingSession<T>)> {
    let link = DeviceLink::connect(t).await?;

    let session = PairingSession::new(link.clone());
    session.start().await?;
    session.confirm(true).await?;

    Ok((link, session))
}
