// Copyright (c) 2024-2025 The Keyfort Developers

//! Keystore queries and transaction signing.
//!
//! [`KeystoreClient`] drives every post pairing operation: root key
//! fingerprint and xpub queries, address verification on the device
//! screen, and signing of transaction proposals. Operations requiring
//! firmware features the connected device lacks fail before any exchange.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitcoin::bip32::{Fingerprint, Xpub};
use log::{debug, warn};

use keyfort_proto::{
    AbsoluteKeypath, Coin, FirmwareVersion, Request, Response, ScriptType, Transport,
};

use crate::account::{AccountAddress, SigningConfig};
use crate::builder::TxProposal;
use crate::chain::Blockchain;
use crate::error::Error;
use crate::link::DeviceLink;
use crate::pairing::PairingSession;
use crate::signer;

/// Oldest firmware the host will talk to
pub const FIRMWARE_MINIMUM: FirmwareVersion = FirmwareVersion::new(2, 0, 0);

/// First firmware able to sign threshold multisig
pub const FIRMWARE_MULTISIG: FirmwareVersion = FirmwareVersion::new(2, 1, 0);

/// First firmware able to sign taproot key spends
pub const FIRMWARE_TAPROOT: FirmwareVersion = FirmwareVersion::new(2, 2, 0);

/// Feature set of a connected device
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Capabilities {
    /// Device can sign taproot key spends
    pub taproot: bool,
    /// Device can sign threshold multisig
    pub multisig: bool,
}

impl Capabilities {
    /// Capabilities implied by a firmware version
    pub fn from_firmware(firmware: FirmwareVersion) -> Self {
        Self {
            taproot: firmware >= FIRMWARE_TAPROOT,
            multisig: firmware >= FIRMWARE_MULTISIG,
        }
    }

    /// Whether a script type is within this feature set
    pub fn supports(&self, script_type: ScriptType) -> bool {
        match script_type {
            ScriptType::P2tr => self.taproot,
            ScriptType::P2wsh => self.multisig,
            _ => true,
        }
    }

    /// Firmware version a script type first shipped in
    pub fn required_firmware(script_type: ScriptType) -> FirmwareVersion {
        match script_type {
            ScriptType::P2tr => FIRMWARE_TAPROOT,
            ScriptType::P2wsh => FIRMWARE_MULTISIG,
            _ => FIRMWARE_MINIMUM,
        }
    }
}

/// Client for key material queries and signing on a paired device.
///
/// Construction requires a paired session, and every operation rechecks
/// the pairing flag, so a client outlives a torn down session only as a
/// source of [`Error::NotPaired`].
pub struct KeystoreClient<T: Transport> {
    link: DeviceLink<T>,
    paired: Arc<AtomicBool>,
    capabilities: Capabilities,
}

impl<T: Transport> fmt::Debug for KeystoreClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeystoreClient")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> KeystoreClient<T> {
    /// Create a client over a paired session
    pub fn new(link: DeviceLink<T>, session: &PairingSession<T>) -> Result<Self, Error> {
        if !session.is_paired() {
            return Err(Error::NotPaired);
        }

        let capabilities = Capabilities::from_firmware(link.firmware());

        Ok(Self {
            link,
            paired: session.paired_flag(),
            capabilities,
        })
    }

    /// Feature set of the connected device
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn ensure_paired(&self) -> Result<(), Error> {
        match self.paired.load(Ordering::SeqCst) {
            true => Ok(()),
            false => Err(Error::NotPaired),
        }
    }

    fn ensure_supported(&self, config: &SigningConfig) -> Result<(), Error> {
        let script_type = config.script_type();
        if !self.capabilities.supports(script_type) {
            let required = Capabilities::required_firmware(script_type);
            warn!(
                "{} needs firmware {}, device runs {}",
                script_type,
                required,
                self.link.firmware()
            );
            return Err(Error::StaleFirmware {
                required,
                actual: self.link.firmware(),
            });
        }

        Ok(())
    }

    /// Fetch the fingerprint of the device root key
    pub async fn root_fingerprint(&self) -> Result<Fingerprint, Error> {
        self.ensure_paired()?;

        let resp = self
            .link
            .request(Request::RootFingerprint)
            .await
            .map_err(Error::into_unavailable)?;

        match resp {
            Response::Fingerprint(fp) => Ok(fp),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Fetch the extended public key at an account keypath.
    ///
    /// The device serializes xpubs with mainnet version bytes for every
    /// coin.
    pub async fn extended_public_key(
        &self,
        coin: Coin,
        keypath: &AbsoluteKeypath,
    ) -> Result<Xpub, Error> {
        self.ensure_paired()?;

        let resp = self
            .link
            .request(Request::GetXpub {
                coin,
                keypath: keypath.clone(),
            })
            .await
            .map_err(Error::into_unavailable)?;

        match resp {
            Response::Xpub(xpub) => Ok(xpub),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Show an address on the device screen and wait for the user to
    /// confirm it matches what the host displays
    pub async fn display_address(
        &self,
        coin: Coin,
        address: &AccountAddress,
    ) -> Result<(), Error> {
        self.ensure_paired()?;
        self.ensure_supported(address.config())?;

        let resp = self
            .link
            .request_user(Request::DisplayAddress {
                coin,
                config: address.config().to_proto(),
                keypath: address.keypath(),
            })
            .await?;

        match resp {
            Response::Ack => Ok(()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Sign every input of a proposal on the device.
    ///
    /// Resolves inputs to their signing configurations, fetches the
    /// previous transactions non taproot inputs need for amount
    /// verification, and exchanges a single signing request. Completing
    /// `cancel` aborts the operation and clears the device prompt. On
    /// success the proposal's signature slots are filled, one per input.
    pub async fn sign_transaction<C>(
        &self,
        chain: &C,
        proposal: &mut TxProposal,
        cancel: impl Future<Output = ()> + Send,
    ) -> Result<(), Error>
    where
        C: Blockchain + ?Sized,
    {
        self.ensure_paired()?;

        let resolution = signer::resolve_inputs(proposal)?;
        for config in &resolution.configs {
            self.ensure_supported(config)?;
        }

        let prev_txs = signer::collect_previous_transactions(chain, proposal, &resolution).await?;
        let request = signer::build_sign_request(proposal, &resolution, prev_txs);

        debug!(
            "Signing {} inputs, {} outputs on the device",
            request.inputs.len(),
            request.outputs.len()
        );

        let resp = tokio::select! {
            r = self.link.request_user(Request::SignTransaction(request)) => match r {
                Err(Error::UserTimeout) => {
                    self.link.abandon().await;
                    return Err(Error::UserTimeout);
                }
                r => r?,
            },
            _ = cancel => {
                debug!("Signing cancelled by the host");
                self.link.abandon().await;
                return Err(Error::UserAborted);
            }
        };

        match resp {
            Response::Signatures(sigs) => signer::fill_slots(proposal, &resolution, sigs),
            _ => Err(Error::UnexpectedResponse),
        }
    }
}
