//! Compression dispatch (§4.2, §3 `CompressionType`). `gzip` via `flate2`,
//! `zstd` via `zstd`, both wrapping whatever the encryption stage (or the
//! raw sink, if unencrypted) expects next.

use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;

pub enum CompressionWriter<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> CompressionWriter<W> {
    pub fn none(writer: W) -> Self {
        Self::None(writer)
    }

    pub fn gzip(writer: W) -> Self {
        Self::Gzip(GzEncoder::new(writer, Compression::default()))
    }

    pub fn zstd(writer: W) -> anyhow::Result<Self> {
        Ok(Self::Zstd(zstd::stream::write::Encoder::new(writer, 0)?))
    }

    /// Flushes the compressor and returns the inner writer.
    pub fn finish(self) -> anyhow::Result<W> {
        match self {
            Self::None(w) => Ok(w),
            Self::Gzip(enc) => Ok(enc.finish()?),
            Self::Zstd(enc) => Ok(enc.finish()?),
        }
    }
}

impl<W: Write> Write for CompressionWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::None(w) => w.write(buf),
            Self::Gzip(enc) => enc.write(buf),
            Self::Zstd(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::None(w) => w.flush(),
            Self::Gzip(enc) => enc.flush(),
            Self::Zstd(enc) => enc.flush(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;

    #[test]
    fn gzip_round_trips() {
        let mut writer = CompressionWriter::gzip(Vec::new());
        writer.write_all(b"tape contents, repeated repeated repeated").unwrap();
        let compressed = writer.finish().unwrap();

        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, "tape contents, repeated repeated repeated");
    }

    #[test]
    fn zstd_round_trips() {
        let mut writer = CompressionWriter::zstd(Vec::new()).unwrap();
        writer.write_all(b"tape contents, repeated repeated repeated").unwrap();
        let compressed = writer.finish().unwrap();

        let mut decoder = zstd::stream::read::Decoder::new(compressed.as_slice()).unwrap();
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, "tape contents, repeated repeated repeated");
    }
}
