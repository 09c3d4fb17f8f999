//! Binlog-at-rest Encryption
//!
//! An encrypted binlog file starts with a Start-Encryption event right
//! after the format description. The event carries a 1-byte scheme id, a
//! 4-byte key version and a 12-byte nonce; every later event in the file
//! is encrypted with an IV of the nonce concatenated with the event's
//! big-endian file offset. Encryption is size-preserving so event offsets
//! and `next_pos` links stay valid on the encrypted bytes.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;

use crate::error::{Error, Result};
use crate::proxy::protocol::{event_type, RepHeader, EVENT_HEADER_LEN};

/// Scheme id carried in the Start-Encryption event
pub const ENCRYPTION_SCHEME_AES: u8 = 1;

/// Nonce length in the Start-Encryption event
pub const NONCE_LEN: usize = 12;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Supported binlog ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinlogCipher {
    AesCbc,
    AesCtr,
}

impl BinlogCipher {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes_cbc" => Some(BinlogCipher::AesCbc),
            "aes_ctr" => Some(BinlogCipher::AesCtr),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BinlogCipher::AesCbc => "aes_cbc",
            BinlogCipher::AesCtr => "aes_ctr",
        }
    }
}

/// Key, nonce and cipher for one binlog file
#[derive(Clone)]
pub struct EncryptionContext {
    pub cipher: BinlogCipher,
    pub key_version: u32,
    pub nonce: [u8; NONCE_LEN],
    key: [u8; 32],
}

impl EncryptionContext {
    pub fn new(cipher: BinlogCipher, key_version: u32, nonce: [u8; NONCE_LEN], key: [u8; 32]) -> Self {
        Self {
            cipher,
            key_version,
            nonce,
            key,
        }
    }

    /// Parse a hex-encoded 256-bit key file
    pub fn load_key(content: &str) -> Result<[u8; 32]> {
        let trimmed: String = content.chars().filter(|c| !c.is_whitespace()).collect();
        if trimmed.len() != 64 {
            return Err(Error::Encryption(format!(
                "encryption key must be 64 hex characters, got {}",
                trimmed.len()
            )));
        }
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&trimmed[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::Encryption("encryption key is not valid hex".into()))?;
        }
        Ok(key)
    }

    /// Build the Start-Encryption event body for this context.
    ///
    /// Post-header layout: scheme(1) | key_version(4) | nonce(12).
    pub fn start_encryption_event(&self, server_id: u32, next_pos: u32, timestamp: u32) -> Vec<u8> {
        let payload_len = 1 + 4 + NONCE_LEN;
        let event_size = (EVENT_HEADER_LEN + payload_len + 4) as u32;
        let mut event = vec![0u8; event_size as usize];

        let header = RepHeader {
            timestamp,
            event_type: event_type::MARIADB_START_ENCRYPTION_EVENT,
            server_id,
            event_size,
            next_pos,
            flags: 0,
        };
        header.write(&mut event);
        event[EVENT_HEADER_LEN] = ENCRYPTION_SCHEME_AES;
        event[EVENT_HEADER_LEN + 1..EVENT_HEADER_LEN + 5]
            .copy_from_slice(&self.key_version.to_le_bytes());
        event[EVENT_HEADER_LEN + 5..EVENT_HEADER_LEN + 5 + NONCE_LEN]
            .copy_from_slice(&self.nonce);
        crate::proxy::protocol::restamp_event_crc(&mut event);
        event
    }

    /// Rebuild a context from a Start-Encryption event payload (the bytes
    /// after the 19-byte header) plus the locally-held key.
    pub fn from_start_encryption(
        payload: &[u8],
        cipher: BinlogCipher,
        key: [u8; 32],
    ) -> Result<Self> {
        if payload.len() < 1 + 4 + NONCE_LEN {
            return Err(Error::Encryption("short Start-Encryption event".into()));
        }
        if payload[0] != ENCRYPTION_SCHEME_AES {
            return Err(Error::Encryption(format!(
                "unsupported encryption scheme {}",
                payload[0]
            )));
        }
        let key_version = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&payload[5..5 + NONCE_LEN]);
        Ok(Self {
            cipher,
            key_version,
            nonce,
            key,
        })
    }

    /// IV for an event stored at `offset`: nonce ‖ be32(offset)
    fn iv(&self, offset: u32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..NONCE_LEN].copy_from_slice(&self.nonce);
        iv[NONCE_LEN..].copy_from_slice(&offset.to_be_bytes());
        iv
    }

    /// Encrypt an event body in place, preserving its length
    pub fn encrypt_event(&self, offset: u32, data: &mut [u8]) -> Result<()> {
        self.apply(offset, data, true)
    }

    /// Decrypt an event body in place
    pub fn decrypt_event(&self, offset: u32, data: &mut [u8]) -> Result<()> {
        self.apply(offset, data, false)
    }

    fn apply(&self, offset: u32, data: &mut [u8], encrypt: bool) -> Result<()> {
        let iv = self.iv(offset);
        match self.cipher {
            BinlogCipher::AesCtr => {
                // CTR is symmetric: the keystream is XORed either way.
                let mut cipher = Aes256Ctr::new(&self.key.into(), &iv.into());
                cipher.apply_keystream(data);
                Ok(())
            }
            BinlogCipher::AesCbc => self.apply_cbc(&iv, data, encrypt),
        }
    }

    /// Size-preserving CBC: whole blocks run through CBC, a partial tail
    /// block is XORed with a keystream derived from the IV and offset so
    /// the ciphertext stays exactly as long as the plaintext.
    fn apply_cbc(&self, iv: &[u8; 16], data: &mut [u8], encrypt: bool) -> Result<()> {
        use aes::cipher::generic_array::GenericArray;
        use aes::cipher::{BlockDecryptMut, BlockEncryptMut};

        let full = data.len() - data.len() % 16;
        if full > 0 {
            if encrypt {
                let mut cbc = Aes256CbcEnc::new(&self.key.into(), iv.into());
                for chunk in data[..full].chunks_exact_mut(16) {
                    cbc.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
                }
            } else {
                let mut cbc = Aes256CbcDec::new(&self.key.into(), iv.into());
                for chunk in data[..full].chunks_exact_mut(16) {
                    cbc.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
                }
            }
        }

        let tail = &mut data[full..];
        if !tail.is_empty() {
            // Keystream block bound to this event's IV.
            let ecb = Aes256::new(&self.key.into());
            let mut block = GenericArray::clone_from_slice(iv);
            ecb.encrypt_block(&mut block);
            for (byte, pad) in tail.iter_mut().zip(block.iter()) {
                *byte ^= pad;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("cipher", &self.cipher)
            .field("key_version", &self.key_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context(cipher: BinlogCipher) -> EncryptionContext {
        EncryptionContext::new(cipher, 1, [7u8; NONCE_LEN], [42u8; 32])
    }

    #[test]
    fn test_key_parsing() {
        let key_hex = "00".repeat(32);
        assert_eq!(EncryptionContext::load_key(&key_hex).unwrap(), [0u8; 32]);
        assert!(EncryptionContext::load_key("abcd").is_err());
        assert!(EncryptionContext::load_key(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_ctr_round_trip_preserves_length() {
        let ctx = test_context(BinlogCipher::AesCtr);
        let original: Vec<u8> = (0..100).collect();
        let mut data = original.clone();

        ctx.encrypt_event(4, &mut data).unwrap();
        assert_eq!(data.len(), original.len());
        assert_ne!(data, original);

        ctx.decrypt_event(4, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_cbc_round_trip_with_partial_block() {
        let ctx = test_context(BinlogCipher::AesCbc);
        // 37 bytes: two whole blocks plus a 5-byte tail
        let original: Vec<u8> = (0..37).collect();
        let mut data = original.clone();

        ctx.encrypt_event(1024, &mut data).unwrap();
        assert_eq!(data.len(), original.len());
        ctx.decrypt_event(1024, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_different_offsets_differ() {
        let ctx = test_context(BinlogCipher::AesCtr);
        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        ctx.encrypt_event(4, &mut a).unwrap();
        ctx.encrypt_event(100, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_start_encryption_event_round_trip() {
        let ctx = test_context(BinlogCipher::AesCtr);
        let event = ctx.start_encryption_event(1001, 4 + 100, 1_700_000_000);

        let header = RepHeader::parse(&event).unwrap();
        assert_eq!(header.event_type, event_type::MARIADB_START_ENCRYPTION_EVENT);
        assert!(crate::proxy::protocol::verify_event_crc(&event));

        let restored = EncryptionContext::from_start_encryption(
            &event[EVENT_HEADER_LEN..event.len() - 4],
            BinlogCipher::AesCtr,
            [42u8; 32],
        )
        .unwrap();
        assert_eq!(restored.key_version, ctx.key_version);
        assert_eq!(restored.nonce, ctx.nonce);
    }

    #[test]
    fn test_wrong_scheme_rejected() {
        let mut payload = vec![9u8];
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&[0u8; NONCE_LEN]);
        assert!(EncryptionContext::from_start_encryption(
            &payload,
            BinlogCipher::AesCtr,
            [0u8; 32]
        )
        .is_err());
    }
}
