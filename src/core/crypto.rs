//! Sealing of records at rest with AES-256-GCM.

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use argon2::Argon2;
use base64::{engine::general_purpose, Engine as _};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use super::utils::ensure_dir;

const MAGIC_PSWD: &[u8; 4] = b"PSWD";

/// Encrypts and decrypts opaque payloads with a single master key.
///
/// Sealed payloads are `base64(nonce || ciphertext)`.
#[derive(Clone)]
pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    /// Builds a sealer from a raw 32-byte key.
    pub fn from_key(key_bytes: &[u8]) -> Result<Self, String> {
        if key_bytes.len() != 32 {
            return Err("Invalid key length".to_string());
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes));
        Ok(Self { cipher })
    }

    /// Loads the master key at `path`, generating it on first use.
    ///
    /// Password-protected keys require `password`.
    pub fn load_or_generate(path: &Path, password: Option<&str>) -> Result<Self, String> {
        let key = load_or_generate_key(path, password)?;
        Self::from_key(&key)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let cipher_bytes = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| "Encrypt error".to_string())?;

        let mut out = Vec::with_capacity(12 + cipher_bytes.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&cipher_bytes);
        Ok(general_purpose::STANDARD.encode(&out))
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, String> {
        let decoded = general_purpose::STANDARD
            .decode(sealed.trim_end())
            .map_err(|_| "Corrupted data".to_string())?;
        if decoded.len() < 12 {
            return Err("Corrupted data".to_string());
        }
        let (nonce_bytes, cipher_bytes) = decoded.split_at(12);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), cipher_bytes)
            .map_err(|_| "Decrypt error".to_string())
    }
}

/// Decrypts the master key using a provided password.
pub fn decrypt_key_with_password(key_data: &[u8], password: &str) -> Result<Vec<u8>, String> {
    if !key_data.starts_with(MAGIC_PSWD) {
        return Err("Key is not password protected.".to_string());
    }
    if key_data.len() < 4 + 16 + 12 {
        return Err("Corrupted password key".to_string());
    }
    let salt = &key_data[4..20];
    let nonce = Nonce::from_slice(&key_data[20..32]);
    let cipher_bytes = &key_data[32..];

    let pwd_key = derive_key(password, salt)?;
    let tmp_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&pwd_key));
    let raw = tmp_cipher
        .decrypt(nonce, cipher_bytes)
        .map_err(|_| "Invalid password".to_string())?;

    if raw.len() != 32 {
        return Err("Corrupted key".to_string());
    }
    Ok(raw)
}

/// Wraps a raw master key with a password-derived key.
pub fn encrypt_key_with_password(key: &[u8], password: &str) -> Result<Vec<u8>, String> {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let pwd_key = derive_key(password, &salt)?;

    let tmp_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&pwd_key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let cipher_bytes = tmp_cipher
        .encrypt(&nonce, key)
        .map_err(|_| "Encrypt error".to_string())?;

    let mut out = Vec::with_capacity(4 + 16 + 12 + cipher_bytes.len());
    out.extend_from_slice(MAGIC_PSWD);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&cipher_bytes);
    Ok(out)
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32], String> {
    let mut pwd_key = [0u8; 32];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut pwd_key)
        .map_err(|_| "KDF error".to_string())?;
    Ok(pwd_key)
}

/// Load or create the master key.
fn load_or_generate_key(path: &Path, password: Option<&str>) -> Result<Vec<u8>, String> {
    if path.exists() {
        let mut buf = Vec::new();
        File::open(path)
            .map_err(|e| format!("Unable to open key: {}", e))?
            .read_to_end(&mut buf)
            .map_err(|e| format!("Unable to read key: {}", e))?;

        if buf.starts_with(MAGIC_PSWD) {
            let password =
                password.ok_or_else(|| "Key is password protected; no password given".to_string())?;
            return decrypt_key_with_password(&buf, password);
        }
        if buf.len() != 32 {
            return Err("Invalid key length".to_string());
        }
        return Ok(buf);
    }

    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let key = Aes256Gcm::generate_key(OsRng);
    let contents = match password {
        Some(password) => encrypt_key_with_password(&key, password)?,
        None => key.to_vec(),
    };
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| format!("Key write error: {}", e))?;
    f.write_all(&contents)
        .map_err(|e| format!("Key write error: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).ok();
    }
    Ok(key.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_payload_opens_with_same_key() {
        let sealer = Sealer::from_key(&[7u8; 32]).unwrap();
        let sealed = sealer.seal(b"checkpoint").unwrap();
        assert_ne!(sealed.as_bytes(), b"checkpoint");
        assert_eq!(sealer.open(&sealed).unwrap(), b"checkpoint");

        let other = Sealer::from_key(&[8u8; 32]).unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn password_protected_key_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("key.bin");

        let first = Sealer::load_or_generate(&path, Some("hunter2")).unwrap();
        let sealed = first.seal(b"data").unwrap();

        let again = Sealer::load_or_generate(&path, Some("hunter2")).unwrap();
        assert_eq!(again.open(&sealed).unwrap(), b"data");
        assert!(Sealer::load_or_generate(&path, Some("wrong")).is_err());
        assert!(Sealer::load_or_generate(&path, None).is_err());
    }
}
