// Copyright (c) 2024-2025 The Keyfort Developers

//! Keyfort host library.
//!
//! Drives a Keyfort hardware signer over any [`Transport`]: pairing with
//! channel hash verification, keystore queries, and the signing flow from
//! proposal construction through device signing, finalization, and host
//! side verification.
//!
//! ```no_run
//! use keyfort::{DeviceLink, KeystoreClient, PairingSession};
//! use keyfort_sim::{SimDevice, SimOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let link = DeviceLink::connect(SimDevice::new(SimOptions::default())?).await?;
//!
//! let session = PairingSession::new(link.clone());
//! session.start().await?;
//! println!("Verify on both screens: {}", session.current_hash()?.0);
//! session.confirm(true).await?;
//!
//! let keystore = KeystoreClient::new(link, &session)?;
//! println!("Root fingerprint: {}", keystore.root_fingerprint().await?);
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod builder;
pub mod chain;
mod error;
pub mod finalize;
pub mod keystore;
mod link;
mod pairing;
mod signer;
pub mod validate;

pub use account::{AccountAddress, KeyInfo, SigningConfig};
pub use builder::{build_proposal, TxProposal, TxTarget, Utxo};
pub use chain::{AccountCode, Blockchain};
pub use error::Error;
pub use finalize::finalize_transaction;
pub use keystore::{Capabilities, KeystoreClient};
pub use link::DeviceLink;
pub use pairing::{PairingEvent, PairingSession, PairingState};
pub use signer::SignatureSlots;
pub use validate::{gather_prevouts, verify_transaction};

/// Re-export protocol types for consumers
pub use keyfort_proto::{self as proto, Coin, ScriptType, Transport};
