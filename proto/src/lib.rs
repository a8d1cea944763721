// Copyright (c) 2024-2025 The Keyfort Developers

//! Keyfort hardware signer protocol definitions.
//!
//! Message types exchanged between a host wallet and a Keyfort signing
//! device, grouped by concern: session and pairing state, key and address
//! queries, and transaction signing. The [`Transport`] trait abstracts over
//! the physical link so the same messages drive real hardware and the
//! software simulator.

pub mod coin;
pub mod keypath;
pub mod script;
pub mod sign;
pub mod state;
pub mod version;

pub use coin::Coin;
pub use keypath::{AbsoluteKeypath, KeypathError, RelativeKeypath};
pub use script::{ScriptConfig, ScriptType, SighashFamily};
pub use sign::{InputSignature, OutputPayload, SignRequest, TxInputDescriptor, TxOutputDescriptor};
pub use state::ChannelHash;
pub use version::FirmwareVersion;

use async_trait::async_trait;
use bitcoin::bip32::{Fingerprint, Xpub};
use strum::{Display, EnumIter, EnumString};

/// Protocol version implemented by this crate
pub const PROTO_VERSION: u8 = 1;

/// Operation codes for device requests
#[derive(Copy, Clone, Debug, PartialEq, Display, EnumString, EnumIter)]
#[repr(u8)]
pub enum Opcode {
    /// Probe the device and fetch its firmware version
    Hello = 0x00,
    /// Open a session, exchanging pairing nonces
    StartSession = 0x01,
    /// Accept or reject the pairing hash shown on the device
    ConfirmPairing = 0x02,

    /// Fetch the fingerprint of the device root key
    RootFingerprint = 0x10,
    /// Fetch an extended public key at an account keypath
    GetXpub = 0x11,
    /// Show a receive address on the device screen
    DisplayAddress = 0x12,

    /// Sign all inputs of a proposed transaction
    SignTransaction = 0x20,

    /// Abort the operation awaiting user confirmation
    Abort = 0x30,
}

/// Failure codes reported by the device
#[derive(Copy, Clone, Debug, PartialEq, Display, EnumIter)]
pub enum DeviceErrorCode {
    /// Operation requires a paired session
    NotPaired,
    /// User rejected the operation on the device
    UserAbort,
    /// Script type not supported by this firmware
    UnsupportedScriptType,
    /// Keypath outside the device derivation policy
    InvalidKeypath,
    /// Previous transaction data does not match the input being spent
    PreviousTransactionMismatch,
    /// Request malformed or internally inconsistent
    BadRequest,
}

/// Link level transport errors
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum LinkError {
    /// Device detached or link closed
    #[error("device disconnected")]
    Disconnected,

    /// Exchange timed out at the transport layer
    #[error("exchange timeout")]
    Timeout,

    /// Peer violated the wire protocol
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Requests issued by the host
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Probe the device, announcing the host protocol version
    Hello {
        /// Protocol version spoken by the host, see [`PROTO_VERSION`]
        protocol: u8,
    },

    /// Open a session, offering the host half of the pairing nonce
    StartSession {
        /// Host contribution to the channel hash
        host_nonce: [u8; 32],
    },

    /// Report the host side pairing decision
    ConfirmPairing {
        /// Whether the user confirmed the channel hash on the host
        accept: bool,
    },

    /// Fetch the fingerprint of the device root key
    RootFingerprint,

    /// Fetch the extended public key at an account keypath
    GetXpub {
        /// Coin the keypath must belong to
        coin: Coin,
        /// Account level keypath, hardened throughout
        keypath: AbsoluteKeypath,
    },

    /// Derive an address and show it on the device screen
    DisplayAddress {
        /// Coin determining the address encoding
        coin: Coin,
        /// Script configuration the address belongs to
        config: ScriptConfig,
        /// Full keypath of the address, account prefix included
        keypath: AbsoluteKeypath,
    },

    /// Sign all inputs of the described transaction
    SignTransaction(SignRequest),

    /// Abort the operation awaiting user confirmation
    Abort,
}

impl Request {
    /// Opcode for this request, used for dispatch and tracing
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Hello { .. } => Opcode::Hello,
            Request::StartSession { .. } => Opcode::StartSession,
            Request::ConfirmPairing { .. } => Opcode::ConfirmPairing,
            Request::RootFingerprint => Opcode::RootFingerprint,
            Request::GetXpub { .. } => Opcode::GetXpub,
            Request::DisplayAddress { .. } => Opcode::DisplayAddress,
            Request::SignTransaction(..) => Opcode::SignTransaction,
            Request::Abort => Opcode::Abort,
        }
    }
}

/// Responses issued by the device
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// Device identification
    Hello {
        /// Firmware version running on the device
        firmware: FirmwareVersion,
    },

    /// Session opened
    Session {
        /// Device contribution to the channel hash
        device_nonce: [u8; 32],
        /// Whether the device already holds a verified pairing for this host
        verified: bool,
    },

    /// Pairing decision of the device side user
    Pairing {
        /// Whether the user confirmed the channel hash on the device
        accepted: bool,
    },

    /// Root key fingerprint
    Fingerprint(Fingerprint),

    /// Extended public key, always serialized with mainnet version bytes
    Xpub(Xpub),

    /// Operation completed with no payload
    Ack,

    /// One signature per transaction input, in input order
    Signatures(Vec<InputSignature>),

    /// Operation failed on the device
    Error(DeviceErrorCode),
}

/// Transport for exchanging requests with a Keyfort device.
///
/// Implementations complete one request/response round trip per call and
/// must not interleave exchanges.
#[async_trait]
pub trait Transport: Send {
    /// Issue a request and await the matching response
    async fn exchange(&mut self, req: Request) -> Result<Response, LinkError>;
}
