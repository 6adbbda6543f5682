//! Tar framing (§4.2) plus the composite write/read chains that glue
//! compression and encryption together around it. Block factor 128 (64
//! KiB records) matches the tape's own block size so every tar record sits
//! on a tape block boundary -- a partial record never spans a block.

use std::io::{self, BufReader, Read, Write};

use tbarr_types::CompressionType;

use crate::compression::CompressionWriter;
use crate::encryption::{EncryptionReader, EncryptionSpec, EncryptionWriter};

pub const BLOCKING_FACTOR: usize = 128;

/// compression(encryption(sink)), or just compression(sink) when the set
/// is unencrypted -- encryption, when present, is always the innermost
/// stage on write.
enum CompositeWriter<W: Write> {
    Plain(CompressionWriter<W>),
    Encrypted(CompressionWriter<EncryptionWriter<W>>),
}

impl<W: Write> CompositeWriter<W> {
    fn new(sink: W, compression: CompressionType, encryption: Option<&EncryptionSpec>) -> anyhow::Result<Self> {
        Ok(match encryption {
            None => Self::Plain(new_compression_writer(sink, compression)?),
            Some(spec) => {
                let enc = EncryptionWriter::new(sink, spec)?;
                Self::Encrypted(new_compression_writer(enc, compression)?)
            }
        })
    }

    fn finish(self) -> anyhow::Result<(W, Option<[u8; 16]>)> {
        match self {
            Self::Plain(c) => Ok((c.finish()?, None)),
            Self::Encrypted(c) => {
                let enc = c.finish()?;
                let (sink, tag) = enc.finish()?;
                Ok((sink, Some(tag)))
            }
        }
    }
}

fn new_compression_writer<W: Write>(sink: W, compression: CompressionType) -> anyhow::Result<CompressionWriter<W>> {
    Ok(match compression {
        CompressionType::None => CompressionWriter::none(sink),
        CompressionType::Gzip => CompressionWriter::gzip(sink),
        CompressionType::Zstd => CompressionWriter::zstd(sink)?,
    })
}

impl<W: Write> Write for CompositeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(c) => c.write(buf),
            Self::Encrypted(c) => c.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(c) => c.flush(),
            Self::Encrypted(c) => c.flush(),
        }
    }
}

/// decryption(decompression(source)), the exact inverse of
/// [`CompositeWriter`].
enum CompositeReader<R: Read> {
    None(R),
    Gz(flate2::read::GzDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
    GzEnc(flate2::read::GzDecoder<EncryptionReader<R>>),
    ZstdEnc(zstd::stream::read::Decoder<'static, BufReader<EncryptionReader<R>>>),
    Enc(EncryptionReader<R>),
}

impl<R: Read> CompositeReader<R> {
    fn new(
        source: R,
        compression: CompressionType,
        encryption: Option<(&EncryptionSpec, [u8; 16])>,
    ) -> anyhow::Result<Self> {
        Ok(match (compression, encryption) {
            (CompressionType::None, None) => Self::None(source),
            (CompressionType::Gzip, None) => Self::Gz(flate2::read::GzDecoder::new(source)),
            (CompressionType::Zstd, None) => {
                Self::Zstd(zstd::stream::read::Decoder::new(BufReader::new(source))?)
            }
            (CompressionType::None, Some((spec, tag))) => {
                Self::Enc(EncryptionReader::new(source, spec, tag)?)
            }
            (CompressionType::Gzip, Some((spec, tag))) => {
                let enc = EncryptionReader::new(source, spec, tag)?;
                Self::GzEnc(flate2::read::GzDecoder::new(enc))
            }
            (CompressionType::Zstd, Some((spec, tag))) => {
                let enc = EncryptionReader::new(source, spec, tag)?;
                Self::ZstdEnc(zstd::stream::read::Decoder::new(BufReader::new(enc))?)
            }
        })
    }
}

impl<R: Read> Read for CompositeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::None(r) => r.read(buf),
            Self::Gz(r) => r.read(buf),
            Self::Zstd(r) => r.read(buf),
            Self::GzEnc(r) => r.read(buf),
            Self::ZstdEnc(r) => r.read(buf),
            Self::Enc(r) => r.read(buf),
        }
    }
}

/// Appends files to a tar stream that is itself flowing through the
/// configured compression/encryption chain before it reaches `sink`.
pub struct ArchiveWriter<W: Write> {
    builder: tar::Builder<CompositeWriter<W>>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(sink: W, compression: CompressionType, encryption: Option<&EncryptionSpec>) -> anyhow::Result<Self> {
        let composite = CompositeWriter::new(sink, compression, encryption)?;
        let mut builder = tar::Builder::new(composite);
        builder.sparse(false);
        Ok(Self { builder })
    }

    /// Appends one file's bytes as a tar entry. `path` is stored exactly
    /// as given (already relativized by the source scanner).
    pub fn append_file(&mut self, path: &str, data: &[u8], mtime: i64, mode: u32) -> anyhow::Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_path(path)?;
        header.set_size(data.len() as u64);
        header.set_mtime(mtime.max(0) as u64);
        header.set_mode(mode);
        header.set_cksum();
        self.builder.append(&header, data)?;
        Ok(())
    }

    /// Writes the tar trailer, drains the compressor, and (if this set is
    /// encrypted) finalizes the GCM tag. Returns the underlying sink so
    /// the caller can flush a final partial tape block and the tag to
    /// record on the segment.
    pub fn finish(self) -> anyhow::Result<(W, Option<[u8; 16]>)> {
        let composite = self.builder.into_inner()?;
        let result = composite.finish();
        if result.is_ok() {
            log::debug!("archive stream finalized");
        }
        result
    }
}

/// Reads tar entries back out of the configured compression/encryption
/// chain, the exact inverse of [`ArchiveWriter`].
pub struct ArchiveReader<R: Read> {
    archive: tar::Archive<CompositeReader<R>>,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(
        source: R,
        compression: CompressionType,
        encryption: Option<(&EncryptionSpec, [u8; 16])>,
    ) -> anyhow::Result<Self> {
        let composite = CompositeReader::new(source, compression, encryption)?;
        Ok(Self {
            archive: tar::Archive::new(composite),
        })
    }

    pub fn entries(&mut self) -> anyhow::Result<tar::Entries<'_, CompositeReader<R>>> {
        Ok(self.archive.entries()?)
    }
}
