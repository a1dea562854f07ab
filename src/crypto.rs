//! Tuya protocol encryption and decryption logic.
//! Supports AES-128-ECB (v3.1 - v3.4) and AES-128-GCM (v3.5), plus the
//! per-version payload encoding and session key negotiation.

use crate::error::{Result, TuyaError};
use crate::protocol::{CommandType, PREFIX_55AA, PREFIX_6699, Version};
use aes::Aes128;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine as _, engine::general_purpose};
use cipher::{BlockDecryptMut, BlockEncryptMut};
use ecb::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;

pub const KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 16;
pub const NONCE_HMAC_LEN: usize = 32;

/// "3.x" followed by 12 zero bytes.
pub const VERSION_HEADER_LEN: usize = 15;
/// "3.1" followed by 16 hex characters of the MD5 signature.
const V31_SIGNED_HEADER_LEN: usize = 19;

/// Commands sent without the 15-byte version header.
const NO_PROTOCOL_HEADER_CMDS: &[u32] = &[
    CommandType::DpQuery as u32,
    CommandType::DpQueryNew as u32,
    CommandType::UpdateDps as u32,
    CommandType::HeartBeat as u32,
    CommandType::SessKeyNegStart as u32,
    CommandType::SessKeyNegResp as u32,
    CommandType::SessKeyNegFinish as u32,
];

/// TuyaCipher provides AES-128 encryption and decryption in ECB and GCM modes.
#[derive(Clone)]
pub struct TuyaCipher {
    /// 16-byte encryption key
    key: [u8; KEY_LEN],
    /// Cached GCM cipher
    gcm: Aes128Gcm,
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let k: [u8; KEY_LEN] = key.try_into().map_err(|_| TuyaError::InvalidKey)?;
        let gcm = Aes128Gcm::new(&k.into());
        Ok(Self { key: k, gcm })
    }

    /// Encrypt data.
    /// * `use_base64`: If true, encode the result in Base64.
    /// * `iv`: Initialization vector. If provided, uses GCM mode; otherwise, ECB mode.
    /// * `header`: Additional authenticated data (AAD) for GCM mode.
    /// * `padding`: If true, applies PKCS7 padding for ECB mode.
    pub fn encrypt(
        &self,
        data: &[u8],
        use_base64: bool,
        iv: Option<&[u8]>,
        header: Option<&[u8]>,
        padding: bool,
    ) -> Result<Vec<u8>> {
        let encrypted_bytes = if let Some(iv_bytes) = iv {
            if iv_bytes.len() < 12 {
                return Err(TuyaError::Crypto("GCM IV too short".into()));
            }
            let iv_bytes = &iv_bytes[..12];
            let payload = Payload {
                msg: data,
                aad: header.unwrap_or(&[]),
            };
            let mut ciphertext = self
                .gcm
                .encrypt(Nonce::from_slice(iv_bytes), payload)
                .map_err(|_| TuyaError::Crypto("GCM encryption failed".into()))?;

            // Format: IV + Ciphertext (includes Tag at the end)
            let mut result = Vec::with_capacity(iv_bytes.len() + ciphertext.len());
            result.extend_from_slice(iv_bytes);
            result.append(&mut ciphertext);
            result
        } else {
            let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());

            let mut buf = data.to_vec();
            if padding {
                let padding_len = 16 - data.len() % 16;
                buf.resize(data.len() + padding_len, padding_len as u8);
            } else if !buf.len().is_multiple_of(16) {
                return Err(TuyaError::Crypto("ECB input is not block aligned".into()));
            }

            for chunk in buf.chunks_mut(16) {
                let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
                encryptor.encrypt_block_mut(block);
            }
            buf
        };

        if use_base64 {
            Ok(general_purpose::STANDARD
                .encode(&encrypted_bytes)
                .into_bytes())
        } else {
            Ok(encrypted_bytes)
        }
    }

    /// Decrypt data.
    /// * `use_base64`: If true, the input data is expected to be Base64 encoded.
    /// * `iv`: Initialization vector. If provided, uses GCM mode; otherwise, ECB mode
    ///   with PKCS7 padding verified and stripped.
    /// * `header`: Additional authenticated data (AAD) for GCM mode.
    /// * `_tag`: (Unused) GCM tag is expected to be at the end of input data.
    pub fn decrypt(
        &self,
        data: &[u8],
        use_base64: bool,
        iv: Option<&[u8]>,
        header: Option<&[u8]>,
        _tag: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let input_data = if use_base64 {
            general_purpose::STANDARD
                .decode(data)
                .map_err(|e| TuyaError::Crypto(format!("base64: {}", e)))?
        } else {
            data.to_vec()
        };

        if let Some(iv_bytes) = iv {
            if iv_bytes.len() < 12 {
                return Err(TuyaError::Crypto("GCM IV too short".into()));
            }
            let payload = Payload {
                msg: &input_data,
                aad: header.unwrap_or(&[]),
            };
            return self
                .gcm
                .decrypt(Nonce::from_slice(&iv_bytes[..12]), payload)
                .map_err(|_| TuyaError::Crypto("GCM authentication failed".into()));
        }

        let mut plaintext = input_data;
        if plaintext.is_empty() || !plaintext.len().is_multiple_of(16) {
            return Err(TuyaError::Crypto(format!(
                "ECB input of {} bytes is not block aligned",
                plaintext.len()
            )));
        }

        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        for chunk in plaintext.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        let pad_len = plaintext[plaintext.len() - 1] as usize;
        if pad_len == 0
            || pad_len > 16
            || plaintext[plaintext.len() - pad_len..]
                .iter()
                .any(|&b| b as usize != pad_len)
        {
            return Err(TuyaError::Crypto("bad padding (wrong key?)".into()));
        }
        plaintext.truncate(plaintext.len() - pad_len);
        Ok(plaintext)
    }
}

/// HMAC-SHA256 of a handshake nonce under the local key.
pub fn nonce_hmac(local_key: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(local_key).map_err(|_| TuyaError::InvalidKey)?;
    mac.update(nonce);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time check of a peer's nonce HMAC.
pub fn verify_nonce_hmac(local_key: &[u8], nonce: &[u8], expected: &[u8]) -> Result<()> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(local_key).map_err(|_| TuyaError::InvalidKey)?;
    mac.update(nonce);
    mac.verify_slice(expected)
        .map_err(|_| TuyaError::Crypto("nonce HMAC mismatch".into()))
}

/// Payload and frame protection for one session, selected by protocol version.
#[derive(Clone)]
pub enum SessionCrypto {
    /// v3.1 - v3.3: the local key is the session key, CRC32 trailer.
    Legacy {
        version: Version,
        key: [u8; KEY_LEN],
        cipher: TuyaCipher,
    },
    /// v3.4: ECB payloads and HMAC-SHA256 trailer.
    Hmac {
        key: [u8; KEY_LEN],
        cipher: TuyaCipher,
    },
    /// v3.5: 6699 frames sealed with AES-GCM.
    Gcm { key: [u8; KEY_LEN] },
}

impl SessionCrypto {
    /// Key material for a fresh connection: the local key itself.
    ///
    /// For v3.4+ this is only good for the negotiation frames; see
    /// [`SessionCrypto::negotiate`].
    pub fn derive_key(local_key: &[u8], version: Version) -> Result<Self> {
        let key: [u8; KEY_LEN] = local_key.try_into().map_err(|_| TuyaError::InvalidKey)?;
        Self::with_key(key, version)
    }

    fn with_key(key: [u8; KEY_LEN], version: Version) -> Result<Self> {
        Ok(match version {
            Version::V3_1 | Version::V3_2 | Version::V3_3 => SessionCrypto::Legacy {
                version,
                key,
                cipher: TuyaCipher::new(&key)?,
            },
            Version::V3_4 => SessionCrypto::Hmac {
                key,
                cipher: TuyaCipher::new(&key)?,
            },
            Version::V3_5 => SessionCrypto::Gcm { key },
        })
    }

    /// Derive the session key from both handshake nonces.
    ///
    /// The nonces are XORed and encrypted under the local key: AES-ECB for
    /// v3.4, AES-GCM with the first 12 bytes of the local nonce as IV for v3.5
    /// (ciphertext only, IV and tag dropped).
    pub fn negotiate(
        local_key: &[u8],
        version: Version,
        local_nonce: &[u8],
        remote_nonce: &[u8],
    ) -> Result<Self> {
        if local_nonce.len() != NONCE_LEN || remote_nonce.len() != NONCE_LEN {
            return Err(TuyaError::Handshake("nonces must be 16 bytes".into()));
        }
        let mixed: Vec<u8> = local_nonce
            .iter()
            .zip(remote_nonce)
            .map(|(a, b)| a ^ b)
            .collect();

        let cipher = TuyaCipher::new(local_key)?;
        let session_key = match version {
            Version::V3_4 => cipher.encrypt(&mixed, false, None, None, false)?,
            Version::V3_5 => {
                cipher.encrypt(&mixed, false, Some(&local_nonce[..12]), None, false)?[12..28]
                    .to_vec()
            }
            other => {
                return Err(TuyaError::Handshake(format!(
                    "version {} has no session key negotiation",
                    other
                )));
            }
        };

        let key: [u8; KEY_LEN] = session_key
            .as_slice()
            .try_into()
            .map_err(|_| TuyaError::Handshake("derived key has wrong length".into()))?;
        Self::with_key(key, version)
    }

    pub fn version(&self) -> Version {
        match self {
            SessionCrypto::Legacy { version, .. } => *version,
            SessionCrypto::Hmac { .. } => Version::V3_4,
            SessionCrypto::Gcm { .. } => Version::V3_5,
        }
    }

    /// Current session key.
    pub fn key(&self) -> &[u8] {
        match self {
            SessionCrypto::Legacy { key, .. }
            | SessionCrypto::Hmac { key, .. }
            | SessionCrypto::Gcm { key } => key,
        }
    }

    /// Frame prefix used by this version.
    pub fn prefix(&self) -> u32 {
        match self {
            SessionCrypto::Gcm { .. } => PREFIX_6699,
            _ => PREFIX_55AA,
        }
    }

    /// Key for the frame trailer (HMAC) or the frame seal (GCM); `None` means CRC32.
    pub fn frame_key(&self) -> Option<&[u8]> {
        match self {
            SessionCrypto::Legacy { .. } => None,
            SessionCrypto::Hmac { key, .. } | SessionCrypto::Gcm { key } => Some(key),
        }
    }

    fn version_header(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(VERSION_HEADER_LEN);
        header.extend_from_slice(self.version().as_bytes());
        header.resize(VERSION_HEADER_LEN, 0);
        header
    }

    fn has_version_header(&self, payload: &[u8]) -> bool {
        payload.len() >= VERSION_HEADER_LEN && payload.starts_with(self.version().as_bytes())
    }

    /// Encode a plaintext payload for the frame body of command `cmd`.
    pub fn encode_payload(&self, cmd: u32, plain: &[u8]) -> Result<Vec<u8>> {
        let use_header = !NO_PROTOCOL_HEADER_CMDS.contains(&cmd);

        match self {
            SessionCrypto::Legacy {
                version: Version::V3_1,
                key,
                cipher,
            } => {
                if cmd != CommandType::Control as u32 {
                    return Ok(plain.to_vec());
                }
                let b64 = cipher.encrypt(plain, true, None, None, true)?;
                let mut out = Version::V3_1.as_bytes().to_vec();
                out.extend_from_slice(&v31_signature(&b64, key));
                out.extend_from_slice(&b64);
                Ok(out)
            }
            SessionCrypto::Legacy { cipher, .. } => {
                let encrypted = cipher.encrypt(plain, false, None, None, true)?;
                if use_header {
                    let mut out = self.version_header();
                    out.extend_from_slice(&encrypted);
                    Ok(out)
                } else {
                    Ok(encrypted)
                }
            }
            SessionCrypto::Hmac { cipher, .. } => {
                if use_header {
                    let mut buf = self.version_header();
                    buf.extend_from_slice(plain);
                    cipher.encrypt(&buf, false, None, None, true)
                } else {
                    cipher.encrypt(plain, false, None, None, true)
                }
            }
            SessionCrypto::Gcm { .. } => {
                // sealed by the frame codec
                if use_header {
                    let mut buf = self.version_header();
                    buf.extend_from_slice(plain);
                    Ok(buf)
                } else {
                    Ok(plain.to_vec())
                }
            }
        }
    }

    /// Decode the payload of a received frame of command `cmd` into plaintext.
    pub fn decode_payload(&self, cmd: u32, payload: Vec<u8>, prefix: u32) -> Result<Vec<u8>> {
        if payload.is_empty() {
            return Ok(payload);
        }
        let strip_header = !CommandType::is_negotiation(cmd);

        match self {
            SessionCrypto::Legacy {
                version: Version::V3_1,
                key,
                cipher,
            } => {
                if !payload.starts_with(Version::V3_1.as_bytes()) {
                    return Ok(payload);
                }
                if payload.len() < V31_SIGNED_HEADER_LEN {
                    return Err(TuyaError::Crypto("truncated v3.1 signature".into()));
                }
                let (signature, b64) = payload[3..].split_at(16);
                if signature != v31_signature(b64, key).as_slice() {
                    return Err(TuyaError::Crypto("v3.1 signature mismatch".into()));
                }
                cipher.decrypt(b64, true, None, None, None)
            }
            SessionCrypto::Legacy { cipher, .. } => {
                let body = if strip_header && self.has_version_header(&payload) {
                    &payload[VERSION_HEADER_LEN..]
                } else {
                    &payload[..]
                };
                if body.is_empty() {
                    return Ok(Vec::new());
                }
                match cipher.decrypt(body, false, None, None, None) {
                    Ok(plain) => Ok(plain),
                    // some firmwares answer status queries unencrypted
                    Err(_) if body.first() == Some(&b'{') => Ok(body.to_vec()),
                    Err(e) => Err(e),
                }
            }
            SessionCrypto::Hmac { cipher, .. } => {
                if prefix != PREFIX_55AA {
                    return Err(TuyaError::Frame("v3.4 expects 55AA frames".into()));
                }
                let plain = cipher.decrypt(&payload, false, None, None, None)?;
                Ok(self.strip_version_header(plain, strip_header))
            }
            SessionCrypto::Gcm { .. } => {
                if prefix != PREFIX_6699 {
                    return Err(TuyaError::Frame("v3.5 expects 6699 frames".into()));
                }
                Ok(self.strip_version_header(payload, strip_header))
            }
        }
    }

    fn strip_version_header(&self, mut payload: Vec<u8>, enabled: bool) -> Vec<u8> {
        if enabled && self.has_version_header(&payload) {
            payload.drain(..VERSION_HEADER_LEN);
        }
        payload
    }
}

impl std::fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        f.debug_struct("SessionCrypto")
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

/// Middle 16 hex characters of md5("data=" + b64 + "||lpv=3.1||" + key).
fn v31_signature(b64: &[u8], key: &[u8]) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(b"data=");
    hasher.update(b64);
    hasher.update(b"||lpv=3.1||");
    hasher.update(key);
    let digest = hex::encode(hasher.finalize());
    digest.as_bytes()[8..24].to_vec()
}
