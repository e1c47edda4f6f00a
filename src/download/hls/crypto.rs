//! AES-128-CBC segment decryption (`EXT-X-KEY:METHOD=AES-128`).

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};

use crate::download::error::DownloadError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Key and IV for one encrypted segment.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SegmentKey {
    /// 16-byte AES key.
    pub key: [u8; 16],
    /// 16-byte CBC initialisation vector.
    pub iv: [u8; 16],
}

impl std::fmt::Debug for SegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentKey")
            .field("iv", &hex::encode(self.iv))
            .finish_non_exhaustive()
    }
}

/// Parses an `IV=0x...` attribute. Short values are left-padded with zeros.
pub(crate) fn parse_iv(value: &str) -> Result<[u8; 16], String> {
    let digits = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    if digits.is_empty() || digits.len() > 32 {
        return Err(format!("invalid IV length in '{value}'"));
    }
    let padded = format!("{digits:0>32}");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(&padded, &mut iv).map_err(|e| format!("invalid IV '{value}': {e}"))?;
    Ok(iv)
}

/// IV derived from a media sequence number: 16-byte big-endian.
pub(crate) fn sequence_iv(sequence: u64) -> [u8; 16] {
    u128::from(sequence).to_be_bytes()
}

/// Decrypts one segment body.
pub(crate) fn decrypt_segment(url: &str, data: &[u8], key: &SegmentKey) -> Result<Bytes, DownloadError> {
    let cipher = Aes128CbcDec::new_from_slices(&key.key, &key.iv)
        .map_err(|e| DownloadError::decryption(url, format!("bad key or IV: {e}")))?;
    let mut buffer = data.to_vec();
    let len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| DownloadError::decryption(url, e.to_string()))?
        .len();
    buffer.truncate(len);
    Ok(Bytes::from(buffer))
}
