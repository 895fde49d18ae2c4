use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::attributes::FileAttributes;
use crate::session::EncodedName;

const MATERIAL_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const NAME_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key material must be {MATERIAL_LEN} bytes, found {0}")]
    BadKeyLength(usize),
    #[error("encryption error")]
    Encryption,
    #[error("decryption error")]
    Decryption,
    #[error("attribute encoding error: {0}")]
    Attributes(#[from] serde_json::Error),
}

/// Keys derived from the account's key material file.
///
/// Names use a nonce derived from the plaintext so that the same name always
/// encrypts to the same bytes and the server can match entries by name.
#[derive(Clone)]
pub struct StoreKeys {
    name: [u8; 32],
    attributes: [u8; 32],
    blocks: [u8; 32],
    hashing: [u8; 32],
}

impl StoreKeys {
    pub fn from_material(material: &[u8]) -> Self {
        Self {
            name: derive_key(b"coffer-names", material),
            attributes: derive_key(b"coffer-attributes", material),
            blocks: derive_key(b"coffer-blocks", material),
            hashing: derive_key(b"coffer-hashing", material),
        }
    }

    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let material = fs::read(path)?;
        if material.len() != MATERIAL_LEN {
            return Err(CryptoError::BadKeyLength(material.len()));
        }
        Ok(Self::from_material(&material))
    }

    /// Loads the key file, writing fresh random material first if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut material = [0u8; MATERIAL_LEN];
            OsRng.fill_bytes(&mut material);
            let mut file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(path)?;
            file.write_all(&material)?;
            file.sync_all()?;
            drop(file);

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
            }
            tracing::info!(path = %path.display(), "created new key material");
        }
        Self::load(path)
    }

    pub fn encrypt_name(&self, name: &str) -> Result<EncodedName, CryptoError> {
        let digest = keyed_digest(&self.hashing, &[b"name", name.as_bytes()]);
        let nonce = &digest[..NONCE_LEN];
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.name));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(nonce), name.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(NAME_VERSION);
        out.extend_from_slice(nonce);
        out.extend_from_slice(&ciphertext);
        Ok(EncodedName(out))
    }

    pub fn decrypt_name(&self, name: &EncodedName) -> Result<String, CryptoError> {
        let data = &name.0;
        if data.len() < 1 + NONCE_LEN || data[0] != NAME_VERSION {
            return Err(CryptoError::Decryption);
        }
        let plaintext = open(&self.name, &data[1..])?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption)
    }

    pub fn seal_attributes(&self, attributes: &FileAttributes) -> Result<Vec<u8>, CryptoError> {
        let plain = serde_json::to_vec(attributes)?;
        seal(&self.attributes, &plain)
    }

    pub fn open_attributes(&self, sealed: &[u8]) -> Result<FileAttributes, CryptoError> {
        let plain = open(&self.attributes, sealed)?;
        Ok(serde_json::from_slice(&plain)?)
    }

    /// Keyed hash over the name and every attribute except the modification time.
    pub fn attributes_hash(&self, name: &str, attributes: &FileAttributes) -> u64 {
        let digest = keyed_digest(
            &self.hashing,
            &[b"attributes", name.as_bytes(), &attributes.hash_material()],
        );
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(first)
    }

    pub fn block_hash(&self, block: &[u8]) -> [u8; 32] {
        keyed_digest(&self.hashing, &[b"block", block])
    }

    pub(crate) fn seal_block(&self, block: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal(&self.blocks, block)
    }

    pub(crate) fn open_block(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open(&self.blocks, sealed)
    }
}

fn seal(key: &[u8; 32], plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|_| CryptoError::Encryption)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::Decryption);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

fn derive_key(label: &[u8], material: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(material);
    let mut key = [0u8; 32];
    key.copy_from_slice(&hasher.finalize());
    key
}

fn keyed_digest(key: &[u8; 32], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> StoreKeys {
        StoreKeys::from_material(&[7u8; 32])
    }

    #[test]
    fn names_encrypt_deterministically() {
        let keys = keys();
        let a = keys.encrypt_name("report.txt").unwrap();
        let b = keys.encrypt_name("report.txt").unwrap();
        let c = keys.encrypt_name("other.txt").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(keys.decrypt_name(&a).unwrap(), "report.txt");
    }

    #[test]
    fn names_from_other_keys_do_not_decrypt() {
        let name = keys().encrypt_name("secret").unwrap();
        let other = StoreKeys::from_material(&[8u8; 32]);
        assert!(matches!(
            other.decrypt_name(&name),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn attribute_hash_ignores_mod_time_but_not_mode() {
        let keys = keys();
        let mut attrs = FileAttributes {
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            mod_time: 1,
            symlink_target: None,
        };
        let base = keys.attributes_hash("a", &attrs);
        attrs.mod_time = 2;
        assert_eq!(keys.attributes_hash("a", &attrs), base);
        attrs.mode = 0o100600;
        assert_ne!(keys.attributes_hash("a", &attrs), base);
        assert_ne!(keys.attributes_hash("b", &attrs), keys.attributes_hash("a", &attrs));
    }

    #[test]
    fn sealed_attributes_round_trip() {
        let keys = keys();
        let attrs = FileAttributes {
            mode: 0o120777,
            uid: 0,
            gid: 0,
            mod_time: 42,
            symlink_target: Some("target".into()),
        };
        let sealed = keys.seal_attributes(&attrs).unwrap();
        assert_eq!(keys.open_attributes(&sealed).unwrap(), attrs);
    }

    #[test]
    fn load_or_create_writes_material_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/material.raw");
        let first = StoreKeys::load_or_create(&path).unwrap();
        let second = StoreKeys::load_or_create(&path).unwrap();
        let name = first.encrypt_name("x").unwrap();
        assert_eq!(second.decrypt_name(&name).unwrap(), "x");
        assert_eq!(std::fs::read(&path).unwrap().len(), 32);
    }

    #[test]
    fn rejects_short_material() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        std::fs::write(&path, b"abc").unwrap();
        assert!(matches!(
            StoreKeys::load(&path),
            Err(CryptoError::BadKeyLength(3))
        ));
    }
}
