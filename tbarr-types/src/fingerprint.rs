use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// SHA-256 fingerprint of an encryption key.
///
/// Only the fingerprint is ever persisted (tape label, `Tape` row,
/// `BackupSet` row) -- the key itself never reaches the catalog or the
/// tape label, per §4.2.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint {
    #[serde(with = "hex_bytes")]
    bytes: [u8; 32],
}

impl Fingerprint {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Fingerprint of a raw AES-256 key, as stored on tape labels.
    pub fn from_key(key: &[u8; 32]) -> Self {
        Self::new(openssl::sha::sha256(key))
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

/// Display the full fingerprint as colon-separated hex, matching the wire
/// format used in tape labels and the catalog's `encryption_key_fingerprint`
/// column.
impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.bytes);
        let parts: Vec<&str> = hex
            .as_bytes()
            .chunks(2)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect();
        write!(f, "{}", parts.join(":"))
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut cleaned = s.to_string();
        cleaned.retain(|c| c != ':');
        let raw = hex::decode(&cleaned)?;
        if raw.len() != 32 {
            bail!("invalid fingerprint length ({} != 32)", raw.len());
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        Ok(Fingerprint::new(bytes))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let raw = hex::decode(&text).map_err(serde::de::Error::custom)?;
        if raw.len() != 32 {
            return Err(serde::de::Error::custom("invalid fingerprint length"));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        Ok(bytes)
    }
}
