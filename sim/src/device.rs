// Copyright (c) 2024-2025 The Keyfort Developers

//! Simulated device transport and session handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::{All, Secp256k1};
use log::debug;

use keyfort_proto::{
    AbsoluteKeypath, Coin, DeviceErrorCode, FirmwareVersion, LinkError, Request, Response,
    ScriptConfig, ScriptType, SignRequest, Transport, PROTO_VERSION,
};

use crate::keys::{self, DeviceKeys};
use crate::signing;
use crate::{ApprovalMode, PairingMode, SimError, SimOptions};

/// First firmware able to sign threshold multisig
const MULTISIG_FIRMWARE: FirmwareVersion = FirmwareVersion::new(2, 1, 0);

/// First firmware able to sign taproot key spends
const TAPROOT_FIRMWARE: FirmwareVersion = FirmwareVersion::new(2, 2, 0);

enum Session {
    Idle,
    AwaitingConfirm,
    Paired,
}

/// Software Keyfort device.
///
/// Speaks the device protocol over [`Transport`] with the request handling
/// of real hardware: queries and signing require a paired session, keypaths
/// are checked against the derivation policy, and previous transactions are
/// verified before signatures are produced. The user at the device is
/// played by the scripted decisions in [`SimOptions`].
pub struct SimDevice {
    options: SimOptions,
    keys: DeviceKeys,
    secp: Secp256k1<All>,
    session: Session,
    session_count: u64,
    connected: Arc<AtomicBool>,
    displayed: Arc<Mutex<Vec<String>>>,
}

impl SimDevice {
    /// Restore a device from its options
    pub fn new(options: SimOptions) -> Result<Self, SimError> {
        let keys = DeviceKeys::from_mnemonic(&options.mnemonic)?;

        Ok(Self {
            options,
            keys,
            secp: Secp256k1::new(),
            session: Session::Idle,
            session_count: 0,
            connected: Arc::new(AtomicBool::new(true)),
            displayed: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Out of band handle to the device, as held by the person at the desk
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            connected: self.connected.clone(),
            displayed: self.displayed.clone(),
        }
    }

    fn is_paired(&self) -> bool {
        matches!(self.session, Session::Paired)
    }

    fn supports(&self, script_type: ScriptType) -> bool {
        match script_type {
            ScriptType::P2tr => self.options.firmware >= TAPROOT_FIRMWARE,
            ScriptType::P2wsh => self.options.firmware >= MULTISIG_FIRMWARE,
            _ => true,
        }
    }

    fn show(&self, line: String) {
        self.displayed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    /// Nonce contribution for the current session, stable for a given
    /// host nonce and session count
    fn device_nonce(&self, host_nonce: &[u8; 32]) -> [u8; 32] {
        let mut engine = sha256::Hash::engine();
        engine.input(b"keyfort-sim-nonce");
        engine.input(&self.session_count.to_le_bytes());
        engine.input(host_nonce);
        sha256::Hash::from_engine(engine).to_byte_array()
    }

    async fn approval(&self) -> Result<(), DeviceErrorCode> {
        match self.options.approval {
            ApprovalMode::Approve => Ok(()),
            ApprovalMode::Reject => Err(DeviceErrorCode::UserAbort),
            ApprovalMode::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    async fn confirm_pairing(&mut self, accept: bool) -> Response {
        if !matches!(self.session, Session::AwaitingConfirm) {
            return Response::Error(DeviceErrorCode::BadRequest);
        }

        if !accept {
            self.session = Session::Idle;
            return Response::Pairing { accepted: false };
        }

        let accepted = match self.options.pairing {
            PairingMode::Accept => true,
            PairingMode::Reject => false,
            PairingMode::Ignore => {
                // Far beyond any host deadline
                tokio::time::sleep(Duration::from_secs(3600)).await;
                false
            }
            PairingMode::Delayed(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
        };

        self.session = match accepted {
            true => Session::Paired,
            false => Session::Idle,
        };

        Response::Pairing { accepted }
    }

    async fn display_address(
        &mut self,
        coin: Coin,
        config: ScriptConfig,
        keypath: AbsoluteKeypath,
    ) -> Response {
        if !self.is_paired() {
            return Response::Error(DeviceErrorCode::NotPaired);
        }
        if !self.supports(config.script_type()) {
            return Response::Error(DeviceErrorCode::UnsupportedScriptType);
        }

        let address = match signing::derive_address(&self.secp, &self.keys, coin, &config, &keypath)
        {
            Ok(address) => address,
            Err(code) => return Response::Error(code),
        };

        debug!("Displaying address {}", address);
        self.show(address.to_string());

        match self.approval().await {
            Ok(()) => Response::Ack,
            Err(code) => Response::Error(code),
        }
    }

    async fn sign(&mut self, req: SignRequest) -> Response {
        if !self.is_paired() {
            return Response::Error(DeviceErrorCode::NotPaired);
        }
        for config in &req.script_configs {
            if !self.supports(config.script_type()) {
                return Response::Error(DeviceErrorCode::UnsupportedScriptType);
            }
        }

        let validated = match signing::validate_request(&self.secp, &self.keys, &req) {
            Ok(validated) => validated,
            Err(code) => return Response::Error(code),
        };

        for line in &validated.review {
            self.show(line.clone());
        }

        if let Err(code) = self.approval().await {
            return Response::Error(code);
        }

        match signing::sign_validated(&self.secp, &validated) {
            Ok(signatures) => Response::Signatures(signatures),
            Err(code) => Response::Error(code),
        }
    }
}

#[async_trait]
impl Transport for SimDevice {
    async fn exchange(&mut self, req: Request) -> Result<Response, LinkError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::Disconnected);
        }

        debug!("Sim request: {}", req.opcode());

        let rsp = match req {
            Request::Hello { protocol } => {
                if protocol != PROTO_VERSION {
                    return Err(LinkError::Protocol(format!(
                        "unsupported protocol version {}",
                        protocol
                    )));
                }
                Response::Hello {
                    firmware: self.options.firmware,
                }
            }

            Request::StartSession { host_nonce } => {
                // Opening a session always drops any standing pairing
                self.session = Session::AwaitingConfirm;
                self.session_count += 1;

                Response::Session {
                    device_nonce: self.device_nonce(&host_nonce),
                    verified: self.options.preverified,
                }
            }

            Request::ConfirmPairing { accept } => self.confirm_pairing(accept).await,

            Request::RootFingerprint => match self.is_paired() {
                true => Response::Fingerprint(self.keys.root_fingerprint(&self.secp)),
                false => Response::Error(DeviceErrorCode::NotPaired),
            },

            Request::GetXpub { coin, keypath } => {
                if !self.is_paired() {
                    Response::Error(DeviceErrorCode::NotPaired)
                } else if !keys::is_account_keypath(&keypath, coin) {
                    Response::Error(DeviceErrorCode::InvalidKeypath)
                } else {
                    match self.keys.account_xpub(&self.secp, &keypath) {
                        Ok(xpub) => Response::Xpub(xpub),
                        Err(_) => Response::Error(DeviceErrorCode::InvalidKeypath),
                    }
                }
            }

            Request::DisplayAddress {
                coin,
                config,
                keypath,
            } => self.display_address(coin, config, keypath).await,

            Request::SignTransaction(req) => self.sign(req).await,

            // Exchanges are serial, so no operation is in flight here;
            // acknowledge and stay in the current session
            Request::Abort => Response::Ack,
        };

        Ok(rsp)
    }
}

/// Observer side of a [`SimDevice`].
///
/// Cloneable and detached from the transport, so tests can unplug the
/// device or inspect its screen while the host holds the link.
#[derive(Clone)]
pub struct SimHandle {
    connected: Arc<AtomicBool>,
    displayed: Arc<Mutex<Vec<String>>>,
}

impl SimHandle {
    /// Unplug the device; every exchange from now on fails
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Lines shown on the device screen so far, oldest first
    pub fn displayed(&self) -> Vec<String> {
        self.displayed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
