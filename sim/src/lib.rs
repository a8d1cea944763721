// Copyright (c) 2024-2025 The Keyfort Developers

//! Software Keyfort device.
//!
//! [`SimDevice`] implements [`Transport`][keyfort_proto::Transport] with the
//! request handling of a real device: pairing sessions, keypath policy,
//! previous transaction verification, and signing. User decisions at the
//! pairing and approval screens are scripted through [`SimOptions`] so hosts
//! can exercise rejection and timeout paths as easily as the happy one.

use std::time::Duration;

use keyfort_proto::FirmwareVersion;

mod device;
pub use device::{SimDevice, SimHandle};

mod keys;
mod signing;

/// Recovery phrase restored onto the device by default
pub const DEFAULT_MNEMONIC: &str = "boring mistake dish oyster truth pigeon \
     viable emerge sort crash wire portion cannon couple enact box walk \
     height pull today solid off enable tide";

/// Scripted outcome of the channel hash confirmation on the device
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PairingMode {
    /// User confirms the hash
    Accept,
    /// User rejects the hash
    Reject,
    /// User never answers, leaving the host to hit its deadline
    Ignore,
    /// User confirms after a delay
    Delayed(Duration),
}

/// Scripted outcome of address and transaction approval screens
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ApprovalMode {
    /// User approves the operation
    Approve,
    /// User rejects the operation
    Reject,
    /// User approves after a delay
    Delay(Duration),
}

/// Simulated device configuration
#[derive(Clone, Debug, PartialEq)]
pub struct SimOptions {
    /// Recovery phrase the device keys are restored from
    pub mnemonic: String,
    /// Firmware version reported to the host
    pub firmware: FirmwareVersion,
    /// Scripted pairing decision
    pub pairing: PairingMode,
    /// Scripted approval decision
    pub approval: ApprovalMode,
    /// Report an existing verified pairing when a session opens
    pub preverified: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            mnemonic: DEFAULT_MNEMONIC.to_string(),
            firmware: FirmwareVersion::new(2, 4, 1),
            pairing: PairingMode::Accept,
            approval: ApprovalMode::Approve,
            preverified: false,
        }
    }
}

/// Simulated device setup errors
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Recovery phrase was not understood
    #[error("Invalid recovery phrase: {0}")]
    Mnemonic(#[from] bip39::Error),

    /// Master key derivation failed
    #[error("Key derivation failure: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),
}
