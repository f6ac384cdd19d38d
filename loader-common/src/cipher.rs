//! AES-CTR encryption of outgoing records and decryption of incoming dump streams.
use std::io::{self, Read};

use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ctr::cipher::{KeyIvInit, StreamCipher};
use flate2::read::MultiGzDecoder;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::domain::EncryptionResult;

pub const IV_LENGTH: usize = 16;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("{field} is not valid base64: {error}")]
    InvalidBase64 {
        field: &'static str,
        error: base64::DecodeError,
    },
    #[error("unsupported key length of {0} bytes")]
    InvalidKeyLength(usize),
    #[error("initialisation vector must be 16 bytes, got {0}")]
    InvalidIvLength(usize),
}

/// AES in counter mode with a 128 bit big endian counter, sized by the key.
enum Keystream {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
}

impl Keystream {
    fn new(key: &[u8], iv: &[u8]) -> Result<Self, CipherError> {
        if iv.len() != IV_LENGTH {
            return Err(CipherError::InvalidIvLength(iv.len()));
        }

        let invalid_key = |_| CipherError::InvalidKeyLength(key.len());

        match key.len() {
            16 => Ok(Keystream::Aes128(
                Aes128Ctr::new_from_slices(key, iv).map_err(invalid_key)?,
            )),
            24 => Ok(Keystream::Aes192(
                Aes192Ctr::new_from_slices(key, iv).map_err(invalid_key)?,
            )),
            32 => Ok(Keystream::Aes256(
                Aes256Ctr::new_from_slices(key, iv).map_err(invalid_key)?,
            )),
            other => Err(CipherError::InvalidKeyLength(other)),
        }
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Keystream::Aes128(cipher) => cipher.apply_keystream(buf),
            Keystream::Aes192(cipher) => cipher.apply_keystream(buf),
            Keystream::Aes256(cipher) => cipher.apply_keystream(buf),
        }
    }
}

/// Decrypts an underlying reader as it is consumed.
pub struct DecryptingReader<R> {
    inner: R,
    keystream: Keystream,
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.keystream.apply(&mut buf[..read]);
        Ok(read)
    }
}

fn decode(field: &'static str, value: &str) -> Result<Vec<u8>, CipherError> {
    STANDARD
        .decode(value.trim())
        .map_err(|error| CipherError::InvalidBase64 { field, error })
}

/// Symmetric cipher operations. Keys and initialisation vectors cross this boundary base64 encoded.
#[derive(Clone, Copy, Debug, Default)]
pub struct CipherEngine;

impl CipherEngine {
    pub fn new() -> Self {
        CipherEngine
    }

    /// Wrap `input` so that reading from it yields plaintext.
    pub fn decrypting_reader<R: Read>(
        &self,
        input: R,
        key: &str,
        iv: &str,
    ) -> Result<DecryptingReader<R>, CipherError> {
        let keystream = Keystream::new(&decode("key", key)?, &decode("initialisation vector", iv)?)?;

        Ok(DecryptingReader {
            inner: input,
            keystream,
        })
    }

    /// Wrap `input` so that reading from it yields the decrypted, then gunzipped, plaintext.
    pub fn decompressing_decrypting_reader<R: Read>(
        &self,
        input: R,
        key: &str,
        iv: &str,
    ) -> Result<MultiGzDecoder<DecryptingReader<R>>, CipherError> {
        Ok(MultiGzDecoder::new(self.decrypting_reader(input, key, iv)?))
    }

    /// Encrypt `plaintext` under `key` with a freshly generated initialisation vector.
    pub fn encrypt(&self, key: &str, plaintext: &[u8]) -> Result<EncryptionResult, CipherError> {
        let mut initialisation_vector = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut initialisation_vector);

        let mut keystream = Keystream::new(&decode("key", key)?, &initialisation_vector)?;
        let mut encrypted = plaintext.to_vec();
        keystream.apply(&mut encrypted);

        Ok(EncryptionResult {
            initialisation_vector: STANDARD.encode(initialisation_vector),
            encrypted: STANDARD.encode(encrypted),
        })
    }

    /// Decrypt a base64 payload produced by `encrypt`.
    pub fn decrypt(&self, key: &str, iv: &str, encrypted: &str) -> Result<Vec<u8>, CipherError> {
        let mut keystream = Keystream::new(&decode("key", key)?, &decode("initialisation vector", iv)?)?;
        let mut decrypted = decode("payload", encrypted)?;
        keystream.apply(&mut decrypted);

        Ok(decrypted)
    }
}
