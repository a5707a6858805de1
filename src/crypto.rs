//! Crypto primitives used by the transfer protocol.
//!
//! - RSA-OAEP (SHA-1) wraps the per-client AES key
//! - AES-256-CBC with PKCS#7 and an all-zero IV protects file contents
//! - POSIX `cksum` CRC over the decrypted file

use crate::error::{Result, TransferError};
use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use crc::{Crc, CRC_32_CKSUM};
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use std::fmt;

pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// The protocol mandates a fixed zero IV.
pub const IV: [u8; 16] = [0; 16];

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const CKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

/// Server-generated AES-256 key.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_SIZE]);

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut key = [0u8; SYMMETRIC_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        SymmetricKey(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; SYMMETRIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
            TransferError::Crypto(format!(
                "symmetric key must be {} bytes, got {}",
                SYMMETRIC_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(SymmetricKey(key))
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.0
    }
}

// Never print key material.
impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Slice off the outer DER element so trailing padding is ignored.
fn outer_der_element(bytes: &[u8]) -> &[u8] {
    if bytes.len() < 2 || bytes[0] != 0x30 {
        return bytes;
    }
    let (len, header) = if bytes[1] < 0x80 {
        (bytes[1] as usize, 2)
    } else {
        let n = (bytes[1] & 0x7f) as usize;
        if n == 0 || n > 4 || bytes.len() < 2 + n {
            return bytes;
        }
        let len = bytes[2..2 + n]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (len, 2 + n)
    };
    bytes.get(..header + len).unwrap_or(bytes)
}

/// Parse a DER public key, SubjectPublicKeyInfo or PKCS#1.
pub fn parse_public_key(der: &[u8]) -> Result<RsaPublicKey> {
    let der = outer_der_element(der);
    RsaPublicKey::from_public_key_der(der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
        .map_err(|e| TransferError::Crypto(format!("unusable public key: {}", e)))
}

/// Encrypt the symmetric key for the holder of `public_key`.
pub fn wrap_key(public_key: &[u8], key: &SymmetricKey) -> Result<Vec<u8>> {
    let public_key = parse_public_key(public_key)?;
    public_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), key.as_bytes())
        .map_err(|e| TransferError::Crypto(format!("key wrap failed: {}", e)))
}

pub fn unwrap_key(private_key: &RsaPrivateKey, wrapped: &[u8]) -> Result<SymmetricKey> {
    let raw = private_key
        .decrypt(Oaep::new::<Sha1>(), wrapped)
        .map_err(|e| TransferError::Crypto(format!("key unwrap failed: {}", e)))?;
    SymmetricKey::from_slice(&raw)
}

pub fn encrypt_file(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), &IV)
        .map_err(|e| TransferError::Crypto(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt a whole uploaded file and strip its padding.
pub fn decrypt_file(key: &SymmetricKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), &IV)
        .map_err(|e| TransferError::Crypto(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| TransferError::Crypto("ciphertext does not decrypt to padded data".into()))
}

/// POSIX `cksum`: CRC-32 over the data followed by its length, least significant byte first.
pub fn cksum(data: &[u8]) -> u32 {
    let mut digest = CKSUM.digest();
    digest.update(data);
    let mut len = data.len() as u64;
    while len != 0 {
        digest.update(&[(len & 0xff) as u8]);
        len >>= 8;
    }
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs8::EncodePublicKey;

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        (private, public)
    }

    #[test]
    fn test_cksum_matches_posix() {
        assert_eq!(cksum(b""), 4294967295);
        assert_eq!(cksum(b"123456789"), 930766865);
    }

    #[test]
    fn test_file_encryption_uses_zero_iv() {
        let key = SymmetricKey::generate();
        let plaintext = b"attack at dawn, bring snacks".to_vec();
        let ciphertext = encrypt_file(&key, &plaintext).unwrap();
        assert_eq!(ciphertext.len() % 16, 0);
        assert_eq!(ciphertext.len(), 32);

        // same key, same plaintext, same ciphertext
        assert_eq!(encrypt_file(&key, &plaintext).unwrap(), ciphertext);
        assert_eq!(decrypt_file(&key, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_decrypt_rejects_wrong_key() {
        let ciphertext = encrypt_file(&SymmetricKey::generate(), b"hello").unwrap();
        // A wrong key almost always breaks the padding; if not, the bytes differ.
        match decrypt_file(&SymmetricKey::generate(), &ciphertext) {
            Err(TransferError::Crypto(_)) => {}
            Ok(plain) => assert_ne!(plain, b"hello"),
            Err(e) => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_decrypt_rejects_partial_block() {
        let key = SymmetricKey::generate();
        assert!(decrypt_file(&key, &[0u8; 15]).is_err());
    }

    #[test]
    fn test_wrap_unwrap_spki_with_padding() {
        let (private, public) = keypair();
        let mut der = public.to_public_key_der().unwrap().as_bytes().to_vec();
        der.extend_from_slice(&[0u8; 8]);

        let key = SymmetricKey::generate();
        let wrapped = wrap_key(&der, &key).unwrap();
        assert_eq!(wrapped.len(), 128);
        assert_eq!(unwrap_key(&private, &wrapped).unwrap(), key);
    }

    #[test]
    fn test_wrap_accepts_pkcs1() {
        let (private, public) = keypair();
        let der = public.to_pkcs1_der().unwrap().as_bytes().to_vec();
        // fits the 160-byte key field of the legacy client
        assert!(der.len() <= 160);

        let key = SymmetricKey::generate();
        let wrapped = wrap_key(&der, &key).unwrap();
        assert_eq!(unwrap_key(&private, &wrapped).unwrap(), key);
    }

    #[test]
    fn test_wrap_rejects_garbage_key() {
        let err = wrap_key(&[0xAB; 160], &SymmetricKey::generate()).unwrap_err();
        assert!(matches!(err, TransferError::Crypto(_)));
    }

    #[test]
    fn test_debug_hides_key() {
        assert_eq!(format!("{:?}", SymmetricKey::generate()), "SymmetricKey(..)");
    }
}
