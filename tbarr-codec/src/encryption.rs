//! AES-256-GCM streaming encryption (§4.2, §6). The nonce is fixed for an
//! entire backup set (never per-file, never randomly regenerated mid-set)
//! so a spanning set can be decrypted file-by-file without replaying the
//! whole stream; only the GCM tag, recorded per tape segment in the
//! catalog, distinguishes one ciphertext run from another.

use std::io::{self, BufRead, Read, Write};

use openssl::symm::{Cipher, Crypter, Mode};

use tbarr_types::Fingerprint;

pub const NONCE_LEN: usize = 12;

/// Everything needed to run the cipher: the raw key (never persisted --
/// only its [`Fingerprint`] is), and the nonce shared by the whole set.
#[derive(Clone)]
pub struct EncryptionSpec {
    pub key: [u8; 32],
    pub nonce: [u8; NONCE_LEN],
    pub fingerprint: Fingerprint,
}

impl EncryptionSpec {
    pub fn new(key: [u8; 32], nonce: [u8; NONCE_LEN]) -> Self {
        let fingerprint = Fingerprint::from_key(&key);
        Self { key, nonce, fingerprint }
    }
}

pub struct EncryptionWriter<W> {
    writer: W,
    block_size: usize,
    encr_buf: Box<[u8; 64 * 1024]>,
    crypter: Crypter,
}

impl<W: Write> EncryptionWriter<W> {
    pub fn new(writer: W, spec: &EncryptionSpec) -> anyhow::Result<Self> {
        let cipher = Cipher::aes_256_gcm();
        let crypter = Crypter::new(cipher, Mode::Encrypt, &spec.key, Some(&spec.nonce))?;
        Ok(Self {
            writer,
            block_size: cipher.block_size(),
            crypter,
            encr_buf: Box::new([0u8; 64 * 1024]),
        })
    }

    /// Flushes the cipher and writes out the final ciphertext bytes,
    /// returning the inner writer and the authentication tag.
    pub fn finish(mut self) -> anyhow::Result<(W, [u8; 16])> {
        let rest = self.crypter.finalize(self.encr_buf.as_mut())?;
        if rest > 0 {
            self.writer.write_all(&self.encr_buf[..rest])?;
        }
        self.writer.flush()?;
        let mut tag = [0u8; 16];
        self.crypter.get_tag(&mut tag)?;
        Ok((self.writer, tag))
    }
}

impl<W: Write> Write for EncryptionWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut write_size = buf.len();
        if write_size > self.encr_buf.len() - self.block_size {
            write_size = self.encr_buf.len() - self.block_size;
        }
        let count = self
            .crypter
            .update(&buf[..write_size], self.encr_buf.as_mut())
            .map_err(|err| io::Error::new(io::ErrorKind::Other, format!("gcm update failed: {err}")))?;
        self.writer.write_all(&self.encr_buf[..count])?;
        Ok(write_size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

pub struct EncryptionReader<R> {
    reader: R,
    block_size: usize,
    crypter: Crypter,
    finalized: bool,
    small_read_buf: Vec<u8>,
}

impl<R: Read> EncryptionReader<R> {
    pub fn new(reader: R, spec: &EncryptionSpec, tag: [u8; 16]) -> anyhow::Result<Self> {
        let cipher = Cipher::aes_256_gcm();
        let mut crypter = Crypter::new(cipher, Mode::Decrypt, &spec.key, Some(&spec.nonce))?;
        crypter.set_tag(&tag)?;
        Ok(Self {
            reader,
            block_size: cipher.block_size(),
            crypter,
            finalized: false,
            small_read_buf: Vec::new(),
        })
    }
}

impl<R: Read> Read for EncryptionReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.fill_buf()?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: Read> EncryptionReader<R> {
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Decrypts the next chunk of plaintext if the pending buffer is
    /// empty, mirroring the cipher's block-at-a-time update/finalize API.
    fn refill(&mut self) -> io::Result<()> {
        if !self.small_read_buf.is_empty() || self.finalized {
            return Ok(());
        }
        let mut chunk = [0u8; 8192];
        let n = self.reader.read(&mut chunk)?;
        let mut outbuf = vec![0u8; n + self.block_size + 32];
        let count = if n == 0 {
            let written = self
                .crypter
                .finalize(&mut outbuf)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, format!("gcm finalize failed: {err}")))?;
            self.finalized = true;
            written
        } else {
            self.crypter
                .update(&chunk[..n], &mut outbuf)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, format!("gcm update failed: {err}")))?
        };
        outbuf.truncate(count);
        self.small_read_buf = outbuf;
        Ok(())
    }
}

/// Gives [`EncryptionReader`] a [`BufRead`] impl so it composes with the
/// `zstd` streaming decoder, which requires one.
impl<R: Read> BufRead for EncryptionReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.refill()?;
        Ok(&self.small_read_buf)
    }

    fn consume(&mut self, amt: usize) {
        self.small_read_buf.drain(..amt.min(self.small_read_buf.len()));
    }
}
