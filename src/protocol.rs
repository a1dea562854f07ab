//! Tuya wire protocol implementation.
//! Handles packet framing, header parsing, and CRC/HMAC/GCM verification.

use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::io::Cursor;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const PREFIX_6699: u32 = 0x00006699;
pub const SUFFIX_55AA: u32 = 0x0000AA55;
pub const SUFFIX_6699: u32 = 0x00009966;

/// Header length of a 55AA frame: Prefix(4), Seq(4), Cmd(4), Len(4)
pub const HEADER_LEN_55AA: usize = 16;
/// Header length of a 6699 frame: Prefix(4), Reserved(2), Seq(4), Cmd(4), Len(4)
pub const HEADER_LEN_6699: usize = 18;

const CRC_LEN: usize = 4;
const HMAC_LEN: usize = 32;
const SUFFIX_LEN: usize = 4;
const RETCODE_LEN: usize = 4;
const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

/// Upper bound on a declared frame length; devices never send more than a few KiB.
pub const MAX_FRAME_LEN: u32 = 0x10000;

define_command_type! {
    ApConfig = 0x01,
    Active = 0x02,
    SessKeyNegStart = 0x03,
    SessKeyNegResp = 0x04,
    SessKeyNegFinish = 0x05,
    Unbind = 0x06,
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    QueryWifi = 0x0b,
    TokenBind = 0x0c,
    ControlNew = 0x0d,
    EnableWifi = 0x0e,
    WifiInfo = 0x0f,
    DpQueryNew = 0x10,
    SceneExecute = 0x11,
    UpdateDps = 0x12,
    UdpNew = 0x13,
    ApConfigNew = 0x14,
    ReqDevInfo = 0x25,
}

define_version! {
    V3_1 = ("3.1", 3.1),
    V3_2 = ("3.2", 3.2),
    V3_3 = ("3.3", 3.3),
    V3_4 = ("3.4", 3.4),
    V3_5 = ("3.5", 3.5),
}

impl CommandType {
    /// Whether the session key negotiation carries this command.
    pub fn is_negotiation(code: u32) -> bool {
        code == CommandType::SessKeyNegStart as u32
            || code == CommandType::SessKeyNegResp as u32
            || code == CommandType::SessKeyNegFinish as u32
    }
}

/// Tuya protocol message structure
#[derive(Debug, Clone, PartialEq)]
pub struct TuyaMessage {
    /// Sequence number
    pub seqno: u32,
    /// Command code
    pub cmd: u32,
    /// Return code, only present in frames sent by the device
    pub retcode: Option<u32>,
    /// Payload (JSON or encrypted binary)
    pub payload: Vec<u8>,
    /// Protocol prefix (0x55AA or 0x6699)
    pub prefix: u32,
    /// GCM IV of a 6699 frame. A random one is generated when packing without it.
    pub iv: Option<Vec<u8>>,
}

impl Default for TuyaMessage {
    fn default() -> Self {
        Self {
            seqno: 0,
            cmd: 0,
            retcode: None,
            payload: Vec::new(),
            prefix: PREFIX_55AA,
            iv: None,
        }
    }
}

/// Tuya protocol header structure
#[derive(Debug, Clone, PartialEq)]
pub struct TuyaHeader {
    pub prefix: u32,
    pub seqno: u32,
    pub cmd: u32,
    /// Declared length field
    pub payload_len: u32,
    /// Total frame length (header + declared length [+ suffix for 6699])
    pub total_length: u32,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| TuyaError::Crypto("invalid HMAC key".into()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Pack TuyaMessage into binary data.
///
/// 55AA frames use an HMAC-SHA256 trailer when `hmac_key` is given and CRC32
/// otherwise. 6699 frames always need the key; it seals the payload with
/// AES-GCM.
pub fn pack_message(msg: &TuyaMessage, hmac_key: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(HEADER_LEN_6699 + msg.payload.len() + HMAC_LEN + 8);

    match msg.prefix {
        PREFIX_55AA => {
            let trailer_len = if hmac_key.is_some() { HMAC_LEN } else { CRC_LEN };
            let retcode_len = if msg.retcode.is_some() { RETCODE_LEN } else { 0 };
            let payload_len = retcode_len + msg.payload.len() + trailer_len + SUFFIX_LEN;

            data.write_u32::<BigEndian>(PREFIX_55AA)?;
            data.write_u32::<BigEndian>(msg.seqno)?;
            data.write_u32::<BigEndian>(msg.cmd)?;
            data.write_u32::<BigEndian>(payload_len as u32)?;
            if let Some(rc) = msg.retcode {
                data.write_u32::<BigEndian>(rc)?;
            }
            data.extend_from_slice(&msg.payload);

            if let Some(key) = hmac_key {
                let digest = hmac_sha256(key, &data)?;
                data.extend_from_slice(&digest);
            } else {
                let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
                let crc_val = crc32.checksum(&data);
                data.write_u32::<BigEndian>(crc_val)?;
            }
            data.write_u32::<BigEndian>(SUFFIX_55AA)?;
        }
        PREFIX_6699 => {
            let key =
                hmac_key.ok_or_else(|| TuyaError::Crypto("6699 frame needs a key".into()))?;

            let mut raw = Vec::with_capacity(RETCODE_LEN + msg.payload.len());
            if let Some(rc) = msg.retcode {
                raw.write_u32::<BigEndian>(rc)?;
            }
            raw.extend_from_slice(&msg.payload);

            let total_payload_len = GCM_IV_LEN + raw.len() + GCM_TAG_LEN;

            data.write_u32::<BigEndian>(PREFIX_6699)?;
            data.write_u16::<BigEndian>(0)?;
            data.write_u32::<BigEndian>(msg.seqno)?;
            data.write_u32::<BigEndian>(msg.cmd)?;
            data.write_u32::<BigEndian>(total_payload_len as u32)?;

            let iv = match msg.iv {
                Some(ref iv) if iv.len() == GCM_IV_LEN => iv.clone(),
                Some(_) => return Err(TuyaError::Crypto("GCM IV must be 12 bytes".into())),
                None => {
                    let mut iv = vec![0u8; GCM_IV_LEN];
                    rand::RngCore::fill_bytes(&mut rand::rng(), &mut iv);
                    iv
                }
            };

            // AAD = Header[4..]
            let cipher = TuyaCipher::new(key)?;
            let sealed = cipher.encrypt(&raw, false, Some(&iv), Some(&data[4..]), false)?;
            data.extend_from_slice(&sealed); // IV + Ciphertext + Tag
            data.write_u32::<BigEndian>(SUFFIX_6699)?;
        }
        other => {
            return Err(TuyaError::Frame(format!("unknown prefix 0x{:08X}", other)));
        }
    }

    Ok(data)
}

/// Parse Tuya header from binary data.
pub fn parse_header(data: &[u8]) -> Result<TuyaHeader> {
    if data.len() < HEADER_LEN_55AA {
        return Err(TuyaError::Frame("header too short".into()));
    }

    let mut cursor = Cursor::new(data);
    let prefix = cursor.read_u32::<BigEndian>()?;

    let header = match prefix {
        PREFIX_55AA => {
            let seqno = cursor.read_u32::<BigEndian>()?;
            let cmd = cursor.read_u32::<BigEndian>()?;
            let payload_len = cursor.read_u32::<BigEndian>()?;
            TuyaHeader {
                prefix,
                seqno,
                cmd,
                payload_len,
                total_length: payload_len.saturating_add(HEADER_LEN_55AA as u32),
            }
        }
        PREFIX_6699 => {
            if data.len() < HEADER_LEN_6699 {
                return Err(TuyaError::Frame("6699 header too short".into()));
            }
            let _reserved = cursor.read_u16::<BigEndian>()?;
            let seqno = cursor.read_u32::<BigEndian>()?;
            let cmd = cursor.read_u32::<BigEndian>()?;
            let payload_len = cursor.read_u32::<BigEndian>()?;
            TuyaHeader {
                prefix,
                seqno,
                cmd,
                payload_len,
                total_length: payload_len.saturating_add((HEADER_LEN_6699 + SUFFIX_LEN) as u32),
            }
        }
        other => {
            return Err(TuyaError::Frame(format!("bad magic 0x{:08X}", other)));
        }
    };

    if header.payload_len > MAX_FRAME_LEN {
        return Err(TuyaError::Frame(format!(
            "declared length {} exceeds limit",
            header.payload_len
        )));
    }
    Ok(header)
}

/// Unpack binary data into TuyaMessage structure.
///
/// `no_retcode`: `Some(true)` for frames sent by a client, `Some(false)` for
/// frames sent by a device, `None` to guess from the payload.
pub fn unpack_message(
    data: &[u8],
    hmac_key: Option<&[u8]>,
    header: Option<TuyaHeader>,
    no_retcode: Option<bool>,
) -> Result<TuyaMessage> {
    let header = match header {
        Some(h) => h,
        None => parse_header(data)?,
    };

    let msg_len = header.total_length as usize;
    if data.len() < msg_len {
        return Err(TuyaError::Frame(format!(
            "declared length {} exceeds available {} bytes",
            msg_len,
            data.len()
        )));
    }

    match header.prefix {
        PREFIX_55AA => unpack_55aa(&data[..msg_len], hmac_key, &header, no_retcode),
        PREFIX_6699 => unpack_6699(&data[..msg_len], hmac_key, &header, no_retcode),
        other => Err(TuyaError::Frame(format!("bad magic 0x{:08X}", other))),
    }
}

fn unpack_55aa(
    data: &[u8],
    hmac_key: Option<&[u8]>,
    header: &TuyaHeader,
    no_retcode: Option<bool>,
) -> Result<TuyaMessage> {
    let trailer_len = if hmac_key.is_some() { HMAC_LEN } else { CRC_LEN };
    let msg_len = data.len();
    if msg_len < HEADER_LEN_55AA + trailer_len + SUFFIX_LEN {
        return Err(TuyaError::Frame(format!(
            "length {} too small for trailer",
            header.payload_len
        )));
    }
    let payload_end = msg_len - trailer_len - SUFFIX_LEN;

    if BigEndian::read_u32(&data[msg_len - SUFFIX_LEN..]) != SUFFIX_55AA {
        return Err(TuyaError::Frame("bad suffix".into()));
    }

    let checksum_data = &data[..payload_end];
    let footer = &data[payload_end..payload_end + trailer_len];
    if let Some(key) = hmac_key {
        if hmac_sha256(key, checksum_data)? != footer {
            return Err(TuyaError::Frame("HMAC mismatch".into()));
        }
    } else {
        let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        if crc32.checksum(checksum_data) != BigEndian::read_u32(footer) {
            return Err(TuyaError::Frame("CRC mismatch".into()));
        }
    }

    let mut payload_start = HEADER_LEN_55AA;
    let body = &data[payload_start..payload_end];
    let should_parse_retcode = match no_retcode {
        Some(no) => !no,
        // Auto-detect: neither JSON nor a version header, and room for 4 bytes
        None => body.len() >= RETCODE_LEN && body[0] != b'{' && body[0] != b'3',
    };

    let mut retcode = None;
    if should_parse_retcode && body.len() >= RETCODE_LEN {
        retcode = Some(BigEndian::read_u32(&body[..RETCODE_LEN]));
        payload_start += RETCODE_LEN;
    }

    Ok(TuyaMessage {
        seqno: header.seqno,
        cmd: header.cmd,
        retcode,
        payload: data[payload_start..payload_end].to_vec(),
        prefix: PREFIX_55AA,
        iv: None,
    })
}

fn unpack_6699(
    data: &[u8],
    hmac_key: Option<&[u8]>,
    header: &TuyaHeader,
    no_retcode: Option<bool>,
) -> Result<TuyaMessage> {
    let key = hmac_key.ok_or_else(|| TuyaError::Crypto("6699 frame needs a key".into()))?;
    let msg_len = data.len();
    if msg_len < HEADER_LEN_6699 + GCM_IV_LEN + GCM_TAG_LEN + SUFFIX_LEN {
        return Err(TuyaError::Frame(format!(
            "length {} too small for IV and tag",
            header.payload_len
        )));
    }
    if BigEndian::read_u32(&data[msg_len - SUFFIX_LEN..]) != SUFFIX_6699 {
        return Err(TuyaError::Frame("bad suffix".into()));
    }

    let sealed = &data[HEADER_LEN_6699..msg_len - SUFFIX_LEN];
    let iv = &sealed[..GCM_IV_LEN];
    let ciphertext_with_tag = &sealed[GCM_IV_LEN..];

    // AAD = Header[4..]
    let cipher = TuyaCipher::new(key)?;
    let mut payload = cipher.decrypt(
        ciphertext_with_tag,
        false,
        Some(iv),
        Some(&data[4..HEADER_LEN_6699]),
        None,
    )?;

    let should_parse_retcode = match no_retcode {
        Some(no) => !no,
        // Auto-detect: retcode is followed by JSON or a version header
        None => {
            payload.len() > RETCODE_LEN
                && payload[0] != b'{'
                && (payload[RETCODE_LEN] == b'{' || payload[RETCODE_LEN] == b'3')
        }
    };

    let mut retcode = None;
    if should_parse_retcode && payload.len() >= RETCODE_LEN {
        retcode = Some(BigEndian::read_u32(&payload[..RETCODE_LEN]));
        payload.drain(..RETCODE_LEN);
    }

    Ok(TuyaMessage {
        seqno: header.seqno,
        cmd: header.cmd,
        retcode,
        payload,
        prefix: PREFIX_6699,
        iv: Some(iv.to_vec()),
    })
}
