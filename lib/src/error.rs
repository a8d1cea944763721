// Copyright (c) 2024-2025 The Keyfort Developers

use bitcoin::{bip32, Amount, Txid};

use keyfort_proto::{DeviceErrorCode, FirmwareVersion, KeypathError, LinkError};

use crate::chain::ChainError;

/// Keyfort API Error Type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Keystore operation without a paired session
    #[error("Device not paired")]
    NotPaired,

    /// Pairing confirmation deadline elapsed
    #[error("Timeout waiting for pairing confirmation")]
    PairingTimeout,

    /// Pairing hash rejected on the host or the device
    #[error("Pairing rejected")]
    PairingRejected,

    /// Concurrent pairing confirmation
    #[error("Pairing confirmation already in progress")]
    PairingBusy,

    /// Device could not be reached
    #[error("Device unavailable")]
    DeviceUnavailable,

    /// Device detached mid operation
    #[error("Device disconnected")]
    DeviceDisconnected,

    /// Firmware too old for the requested operation
    #[error("Firmware {actual} too old (requires {required})")]
    StaleFirmware {
        /// Minimum firmware version for the operation
        required: FirmwareVersion,
        /// Firmware version reported by the device
        actual: FirmwareVersion,
    },

    /// Script type outside the supported set
    #[error("Unsupported script type")]
    UnsupportedScriptType,

    /// Signing configuration internally inconsistent
    #[error("Invalid signing configuration")]
    InvalidConfiguration,

    /// Transaction target malformed or zero valued
    #[error("Invalid transaction target")]
    InvalidTarget,

    /// Balance cannot cover the requested amount plus fees
    #[error("Insufficient funds (needed: {needed}, available: {available})")]
    InsufficientFunds {
        /// Total spendable balance
        available: Amount,
        /// Amount plus fee at the point selection failed
        needed: Amount,
    },

    /// Input could not be matched to its signing configuration
    #[error("Could not resolve signing configuration for input {0}")]
    InputResolutionFailure(usize),

    /// Previous transaction backing an input could not be fetched
    #[error("Previous transaction {0} unavailable")]
    PreviousTransactionUnavailable(Txid),

    /// User denied operation
    #[error("Operation rejected by user")]
    UserAborted,

    /// Timeout waiting for user
    #[error("Timeout waiting for user interaction")]
    UserTimeout,

    /// Request timeout
    #[error("Timeout waiting for device response")]
    RequestTimeout,

    /// Signature missing during finalization
    #[error("Missing signature for input {0}")]
    IncompleteSignatures(usize),

    /// Signature algorithm does not match the input script type
    #[error("Signature for input {0} does not match its script type")]
    SignatureMismatch(usize),

    /// Signature slot already filled
    #[error("Signature slot {0} already filled")]
    SlotOccupied(usize),

    /// Independent verification of a signed transaction failed
    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    /// Unexpected device response
    #[error("Unexpected device response")]
    UnexpectedResponse,

    /// Keypath malformed or out of range
    #[error("Keypath error: {0}")]
    Keypath(#[from] KeypathError),

    /// Key derivation failed
    #[error("Key derivation error: {0}")]
    Bip32(#[from] bip32::Error),

    /// Blockchain backend failure
    #[error("Blockchain backend failure: {0}")]
    Chain(String),

    /// Failure code reported by the device
    #[error("Device error: {0}")]
    Device(DeviceErrorCode),

    /// Transport failure
    #[error("Link error: {0}")]
    Link(LinkError),
}

impl Error {
    /// Relabel a mid-exchange disconnect as plain unreachability, used by
    /// operations where no device state can have been lost
    pub(crate) fn into_unavailable(self) -> Self {
        match self {
            Error::DeviceDisconnected => Error::DeviceUnavailable,
            e => e,
        }
    }
}

impl From<LinkError> for Error {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Disconnected => Error::DeviceDisconnected,
            LinkError::Timeout => Error::RequestTimeout,
            e => Error::Link(e),
        }
    }
}

impl From<DeviceErrorCode> for Error {
    fn from(c: DeviceErrorCode) -> Self {
        match c {
            DeviceErrorCode::NotPaired => Error::NotPaired,
            DeviceErrorCode::UserAbort => Error::UserAborted,
            DeviceErrorCode::UnsupportedScriptType => Error::UnsupportedScriptType,
            c => Error::Device(c),
        }
    }
}

impl From<ChainError> for Error {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::NotFound(txid) => Error::PreviousTransactionUnavailable(txid),
            ChainError::Backend(msg) => Error::Chain(msg),
        }
    }
}
