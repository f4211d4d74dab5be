//! Passphrase encryption of archive files
//!
//! Encrypted file layout:
//! - 6 bytes: magic header "VKENC2"
//! - 7 bytes: random nonce prefix
//! - chunks: AES-256-GCM STREAM (big-endian 32-bit counter), each chunk
//!   `CHUNK_SIZE` bytes of plaintext plus a 16-byte tag; the final chunk is
//!   shorter and flagged as last
//!
//! Archives are processed one chunk at a time, so memory use does not grow
//! with the data directory. The key is derived from the passphrase with
//! Argon2id. Per-chunk tags and the last-chunk flag make a wrong passphrase, a
//! tampered chunk or a truncated file fail loudly instead of producing garbage
//! that would then be unpacked over the data directory.

use std::fs;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::aead::{AeadCore, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use argon2::Argon2;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Error, Result};

/// Magic bytes identifying an encrypted archive
pub const ENCRYPTED_MAGIC: &[u8; 6] = b"VKENC2";

/// Size of the STREAM nonce prefix in bytes
pub const NONCE_PREFIX_SIZE: usize = 7;

/// Plaintext bytes per encrypted chunk
pub const CHUNK_SIZE: usize = 64 * 1024;

const TAG_SIZE: usize = 16;

const HEADER_SIZE: usize = 6 + NONCE_PREFIX_SIZE;

/// Derive a 256-bit archive key from a passphrase using Argon2id
///
/// Uses a fixed application salt so the same passphrase always yields the same
/// key; a backup can be restored on any host that knows the passphrase.
pub fn derive_key(passphrase: &str) -> Result<[u8; 32]> {
    // Fixed application salt - changing this would orphan every existing backup
    const APP_SALT: &[u8; 16] = b"vaultkeep-arc-v1";

    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), APP_SALT, &mut key)
        .map_err(|e| Error::Encryption(format!("Failed to derive key: {}", e)))?;
    Ok(key)
}

fn cipher_for(passphrase: &str) -> Result<Aes256Gcm> {
    let key = derive_key(passphrase)?;
    Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Encryption(format!("Failed to create cipher: {}", e)))
}

fn invalid_chunk() -> Error {
    Error::Encryption("Decryption failed: wrong passphrase or corrupted archive".to_string())
}

/// Fill `buf` as far as the reader allows; returns the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Encrypt everything `reader` yields into `writer`
pub fn encrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    passphrase: &str,
) -> Result<()> {
    let cipher = cipher_for(passphrase)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let prefix = &nonce[..NONCE_PREFIX_SIZE];
    let mut encryptor = EncryptorBE32::from_aead(cipher, prefix.into());

    writer.write_all(ENCRYPTED_MAGIC)?;
    writer.write_all(prefix)?;

    // One chunk of read-ahead tells whether the current chunk is the last
    let mut current = vec![0u8; CHUNK_SIZE];
    let mut ahead = vec![0u8; CHUNK_SIZE];
    let mut filled = read_full(&mut reader, &mut current)?;
    loop {
        let next = if filled == CHUNK_SIZE {
            read_full(&mut reader, &mut ahead)?
        } else {
            0
        };
        if next == 0 {
            let chunk = encryptor
                .encrypt_last(&current[..filled])
                .map_err(|e| Error::Encryption(format!("Encryption failed: {}", e)))?;
            writer.write_all(&chunk)?;
            break;
        }
        let chunk = encryptor
            .encrypt_next(&current[..filled])
            .map_err(|e| Error::Encryption(format!("Encryption failed: {}", e)))?;
        writer.write_all(&chunk)?;
        std::mem::swap(&mut current, &mut ahead);
        filled = next;
    }

    writer.flush()?;
    Ok(())
}

/// Decrypt a stream produced by `encrypt_stream` into `writer`
///
/// Plaintext of authenticated chunks reaches `writer` before the last chunk
/// is checked; callers that need all-or-nothing output write to a temporary.
pub fn decrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    passphrase: &str,
) -> Result<()> {
    let mut header = [0u8; HEADER_SIZE];
    let got = read_full(&mut reader, &mut header)?;
    if got < header.len() || !is_encrypted(&header) {
        return Err(Error::Validation(
            "Encryption header missing or invalid".to_string(),
        ));
    }

    let cipher = cipher_for(passphrase)?;
    let prefix = &header[ENCRYPTED_MAGIC.len()..];
    let mut decryptor = DecryptorBE32::from_aead(cipher, prefix.into());

    let mut current = vec![0u8; CHUNK_SIZE + TAG_SIZE];
    let mut ahead = vec![0u8; CHUNK_SIZE + TAG_SIZE];
    let mut filled = read_full(&mut reader, &mut current)?;
    loop {
        let next = if filled == current.len() {
            read_full(&mut reader, &mut ahead)?
        } else {
            0
        };
        if next == 0 {
            let plain = decryptor
                .decrypt_last(&current[..filled])
                .map_err(|_| invalid_chunk())?;
            writer.write_all(&plain)?;
            break;
        }
        let plain = decryptor
            .decrypt_next(&current[..filled])
            .map_err(|_| invalid_chunk())?;
        writer.write_all(&plain)?;
        std::mem::swap(&mut current, &mut ahead);
        filled = next;
    }

    writer.flush()?;
    Ok(())
}

/// Encrypt bytes into the archive envelope
pub fn encrypt_bytes(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(plaintext.len() + 64);
    encrypt_stream(plaintext, &mut out, passphrase)?;
    Ok(out)
}

/// Whether bytes start with the encrypted archive header
pub fn is_encrypted(data: &[u8]) -> bool {
    data.starts_with(ENCRYPTED_MAGIC)
}

/// Decrypt bytes produced by `encrypt_bytes`
pub fn decrypt_bytes(data: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    decrypt_stream(data, &mut out, passphrase)?;
    Ok(out)
}

/// Temporary file next to `dest`, renamed over it once fully written
fn temp_beside(dest: &Path) -> Result<NamedTempFile> {
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok(NamedTempFile::new_in(dir)?)
}

fn persist(temp: NamedTempFile, dest: &Path) -> Result<()> {
    temp.persist(dest).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Encrypt the file at `source` into `dest`
pub fn encrypt_file(source: &Path, dest: &Path, passphrase: &str) -> Result<()> {
    let reader = BufReader::new(fs::File::open(source)?);
    let mut temp = temp_beside(dest)?;
    encrypt_stream(reader, BufWriter::new(temp.as_file_mut()), passphrase)?;
    persist(temp, dest)?;
    debug!("Encrypted {} -> {}", source.display(), dest.display());
    Ok(())
}

/// Decrypt the file at `source` into `dest`
///
/// Nothing is written to `dest` unless every chunk authenticates.
pub fn decrypt_file(source: &Path, dest: &Path, passphrase: &str) -> Result<()> {
    let reader = BufReader::new(fs::File::open(source)?);
    let mut temp = temp_beside(dest)?;
    decrypt_stream(reader, BufWriter::new(temp.as_file_mut()), passphrase)?;
    persist(temp, dest)?;
    debug!("Decrypted {} -> {}", source.display(), dest.display());
    Ok(())
}

/// Hex SHA-256 of a file, logged next to uploads so copies can be verified
pub fn file_digest(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
