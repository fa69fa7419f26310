use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lagoon_sdk::{Error, MnemonicCipher, Result};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Serialized form of an encrypted mnemonic, stored as the wallet's
/// `encrypted_mnemonic` bytes.
#[derive(Serialize, Deserialize)]
struct EncryptedMnemonic {
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Argon2 key derivation + AES-256-GCM. Every encryption draws a fresh salt
/// and nonce.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmCipher;

fn crypto_err(e: impl std::fmt::Display) -> Error {
    Error::Cipher(e.to_string())
}

fn cipher_for(password: &str, salt: &[u8]) -> Result<Aes256Gcm> {
    let mut key_bytes = [0u8; 32];
    argon2::Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key_bytes)
        .map_err(crypto_err)?;
    let cipher = Aes256Gcm::new_from_slice(&key_bytes).map_err(crypto_err);
    key_bytes.zeroize();
    cipher
}

impl MnemonicCipher for AesGcmCipher {
    fn encrypt(&self, mnemonic: &[u8], password: &str) -> Result<Vec<u8>> {
        if password.is_empty() {
            return Err(Error::MissingPassword);
        }
        let salt: [u8; SALT_LEN] = rand::random();
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();

        let cipher = cipher_for(password, &salt)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), mnemonic)
            .map_err(crypto_err)?;

        let envelope = EncryptedMnemonic {
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        };
        serde_json::to_vec(&envelope).map_err(crypto_err)
    }

    fn decrypt(&self, encrypted: &[u8], password: &str) -> Result<Vec<u8>> {
        let envelope: EncryptedMnemonic = serde_json::from_slice(encrypted).map_err(crypto_err)?;
        let salt = BASE64.decode(&envelope.salt).map_err(crypto_err)?;
        let nonce_bytes = BASE64.decode(&envelope.nonce).map_err(crypto_err)?;
        let ciphertext = BASE64.decode(&envelope.ciphertext).map_err(crypto_err)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(Error::Cipher(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce_bytes.len()
            )));
        }

        let cipher = cipher_for(password, &salt)?;
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| Error::InvalidPassword)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MNEMONIC: &[u8] = b"abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn decrypts_with_the_same_password() {
        let encrypted = AesGcmCipher.encrypt(MNEMONIC, "secret").unwrap();
        assert_eq!(AesGcmCipher.decrypt(&encrypted, "secret").unwrap(), MNEMONIC);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let encrypted = AesGcmCipher.encrypt(MNEMONIC, "secret").unwrap();
        assert!(matches!(
            AesGcmCipher.decrypt(&encrypted, "other"),
            Err(Error::InvalidPassword)
        ));
    }

    #[test]
    fn salt_and_nonce_are_fresh() {
        let a = AesGcmCipher.encrypt(MNEMONIC, "secret").unwrap();
        let b = AesGcmCipher.encrypt(MNEMONIC, "secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn garbage_is_a_cipher_error() {
        assert!(matches!(
            AesGcmCipher.decrypt(b"not an envelope", "secret"),
            Err(Error::Cipher(_))
        ));
        assert!(matches!(
            AesGcmCipher.encrypt(MNEMONIC, ""),
            Err(Error::MissingPassword)
        ));
    }
}
