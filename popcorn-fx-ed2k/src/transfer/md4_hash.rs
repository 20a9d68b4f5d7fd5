use crate::transfer::{Error, Result};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// The byte length of an ED2K file hash.
pub const MD4_HASH_LEN: usize = 16;

/// The MD4 based identity of the content of a transfer.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Md4Hash([u8; MD4_HASH_LEN]);

impl Md4Hash {
    /// Create a new hash from the given raw bytes.
    pub const fn new(bytes: [u8; MD4_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Try to create a hash from the given byte slice.
    ///
    /// # Returns
    ///
    /// It returns an error when the slice doesn't contain exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; MD4_HASH_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidHash(format!(
                "expected {} bytes, but got {}",
                MD4_HASH_LEN,
                bytes.len()
            ))
        })?;

        Ok(Self(bytes))
    }

    /// Get the raw bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; MD4_HASH_LEN] {
        &self.0
    }
}

impl FromStr for Md4Hash {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let bytes = hex::decode(value.trim())?;
        Self::from_slice(&bytes)
    }
}

impl Display for Md4Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl Debug for Md4Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Md4Hash({})", self)
    }
}
