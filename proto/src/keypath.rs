// Copyright (c) 2024-2025 The Keyfort Developers

//! BIP-32 keypath newtypes.
//!
//! [`AbsoluteKeypath`] is rooted at the master key and rendered with a
//! leading `m`. [`RelativeKeypath`] is rooted at an account key and is
//! always an unhardened branch/index pair, so address derivation can never
//! require private key material.

use core::fmt::{self, Display};
use core::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath};

/// Lowest hardened child index
const HARDENED_BOUND: u32 = 1 << 31;

/// Errors constructing or parsing keypaths
#[derive(Copy, Clone, Debug, PartialEq, thiserror::Error)]
pub enum KeypathError {
    /// String form not understood
    #[error("malformed keypath")]
    Malformed,

    /// Component index outside the unhardened range
    #[error("keypath component out of range")]
    ComponentRange,
}

/// Keypath rooted at the master key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbsoluteKeypath(DerivationPath);

impl AbsoluteKeypath {
    /// Append a relative keypath, yielding the full derivation path
    pub fn join(&self, rel: &RelativeKeypath) -> AbsoluteKeypath {
        AbsoluteKeypath(self.0.extend(rel.children()))
    }

    /// Check whether this keypath extends `prefix`
    pub fn starts_with(&self, prefix: &AbsoluteKeypath) -> bool {
        self.components().starts_with(prefix.components())
    }

    /// Borrow the underlying derivation path
    pub fn path(&self) -> &DerivationPath {
        &self.0
    }

    /// Borrow the path components
    pub fn components(&self) -> &[ChildNumber] {
        self.0.as_ref()
    }

    /// Fetch a single component
    pub fn get(&self, index: usize) -> Option<ChildNumber> {
        self.components().get(index).copied()
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.components().len()
    }

    /// Whether the keypath is the bare master key
    pub fn is_empty(&self) -> bool {
        self.components().is_empty()
    }
}

impl From<DerivationPath> for AbsoluteKeypath {
    fn from(path: DerivationPath) -> Self {
        Self(path)
    }
}

impl Display for AbsoluteKeypath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "m")?;
        for c in self.components() {
            write!(f, "/{}", c)?;
        }
        Ok(())
    }
}

impl FromStr for AbsoluteKeypath {
    type Err = KeypathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s != "m" && !s.starts_with("m/") {
            return Err(KeypathError::Malformed);
        }

        let path = DerivationPath::from_str(s).map_err(|_| KeypathError::Malformed)?;

        Ok(Self(path))
    }
}

/// Unhardened branch/index pair rooted at an account key
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RelativeKeypath {
    branch: u32,
    index: u32,
}

impl RelativeKeypath {
    /// Create a relative keypath, rejecting hardened components
    pub fn new(branch: u32, index: u32) -> Result<Self, KeypathError> {
        if branch >= HARDENED_BOUND || index >= HARDENED_BOUND {
            return Err(KeypathError::ComponentRange);
        }

        Ok(Self { branch, index })
    }

    /// Relative keypath on the receive branch
    pub fn receive(index: u32) -> Result<Self, KeypathError> {
        Self::new(0, index)
    }

    /// Relative keypath on the change branch
    pub fn change(index: u32) -> Result<Self, KeypathError> {
        Self::new(1, index)
    }

    /// Branch component, `0` for receive and `1` for change
    pub fn branch(&self) -> u32 {
        self.branch
    }

    /// Address index within the branch
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Path components for derivation
    pub fn children(&self) -> [ChildNumber; 2] {
        [
            ChildNumber::Normal { index: self.branch },
            ChildNumber::Normal { index: self.index },
        ]
    }
}

impl Display for RelativeKeypath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.branch, self.index)
    }
}
