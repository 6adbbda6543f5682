//! On-tape label record (§6): a pipe-delimited ASCII record written as the
//! variable-block, 512-byte file #0.
//!
//! `TAPEBACKARR|<label>|<uuid>|<pool>|<unix_ts>|<enc_fingerprint>|<compression_type>`
//!
//! Trailing fields may be missing for tapes written by older versions;
//! only the magic prefix is mandatory (§9 "dynamic label field growth").

use anyhow::{bail, Error};
use uuid::Uuid;

use tbarr_types::{CompressionType, Fingerprint};

pub const LABEL_MAGIC: &str = "TAPEBACKARR";
pub const LABEL_BLOCK_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeLabel {
    pub label_text: String,
    pub uuid: Uuid,
    pub pool: String,
    pub ctime: i64,
    pub encryption_key_fingerprint: Option<Fingerprint>,
    pub compression_type: Option<CompressionType>,
}

impl TapeLabel {
    pub fn new(label_text: &str, uuid: Uuid, pool: &str, ctime: i64) -> Self {
        Self {
            label_text: label_text.to_string(),
            uuid,
            pool: pool.to_string(),
            ctime,
            encryption_key_fingerprint: None,
            compression_type: None,
        }
    }

    /// Serializes to the pipe-delimited record, padded with zero bytes to
    /// exactly `LABEL_BLOCK_SIZE`.
    pub fn to_block(&self) -> Result<[u8; LABEL_BLOCK_SIZE], Error> {
        let fingerprint = self
            .encryption_key_fingerprint
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_default();
        let compression = self
            .compression_type
            .map(|c| c.to_string())
            .unwrap_or_default();

        let record = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            LABEL_MAGIC, self.label_text, self.uuid, self.pool, self.ctime, fingerprint, compression,
        );

        if record.len() > LABEL_BLOCK_SIZE {
            bail!(
                "tape label record too long ({} > {})",
                record.len(),
                LABEL_BLOCK_SIZE
            );
        }

        let mut block = [0u8; LABEL_BLOCK_SIZE];
        block[..record.len()].copy_from_slice(record.as_bytes());
        Ok(block)
    }

    /// Parses a raw 512-byte (or shorter) label block. Accepts any
    /// prefix-complete record: trailing fields missing entirely are
    /// tolerated, but the magic prefix is mandatory.
    pub fn from_block(data: &[u8]) -> Result<Self, Error> {
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        let text = std::str::from_utf8(&data[..end])?;
        let mut fields = text.split('|');

        let magic = fields.next().unwrap_or_default();
        if magic != LABEL_MAGIC {
            bail!("not a tape label (bad magic)");
        }

        let label_text = fields.next().unwrap_or_default().to_string();
        let uuid: Uuid = fields
            .next()
            .ok_or_else(|| anyhow::anyhow!("label missing uuid field"))?
            .parse()?;
        let pool = fields.next().unwrap_or_default().to_string();
        let ctime: i64 = match fields.next() {
            Some(s) if !s.is_empty() => s.parse()?,
            _ => 0,
        };
        let encryption_key_fingerprint = match fields.next() {
            Some(s) if !s.is_empty() => Some(s.parse()?),
            _ => None,
        };
        let compression_type = match fields.next() {
            Some(s) if !s.is_empty() => Some(s.parse()?),
            _ => None,
        };

        Ok(Self {
            label_text,
            uuid,
            pool,
            ctime,
            encryption_key_fingerprint,
            compression_type,
        })
    }
}
