//! One connection to a Tuya device.
//! Handles the v3.4+ session key negotiation, sequence numbers and
//! request/response correlation. Every error is terminal for the session.

use crate::crypto::{NONCE_HMAC_LEN, NONCE_LEN, SessionCrypto, nonce_hmac, verify_nonce_hmac};
use crate::device::{Device, RELAY_DP};
use crate::error::{Result, TuyaError};
use crate::protocol::{CommandType, TuyaMessage, Version, pack_message, unpack_message};
use crate::transport::Transport;
use log::{debug, info, warn};
use rand::RngCore;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const KEY_DPS: &str = "dps";
const KEY_T: &str = "t";
const KEY_DATA: &str = "data";
const KEY_PROTOCOL: &str = "protocol";
const KEY_GW_ID: &str = "gwId";
const KEY_DEV_ID: &str = "devId";
const KEY_UID: &str = "uid";

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket open, no key negotiated yet (or negotiation failed)
    Disconnected,
    /// Exchanging nonces (v3.4+)
    Handshaking,
    /// Ready for command exchanges
    Ready,
    /// Closed explicitly or after an error; not reusable
    Closed,
}

/// Decoded reply to a single request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse {
    pub seqno: u32,
    pub cmd: u32,
    pub retcode: Option<u32>,
    /// Decoded JSON body; an empty acknowledgement decodes to `{}`.
    pub payload: Value,
}

impl CommandResponse {
    /// Parse the decrypted payload of a device reply.
    pub fn from_message(msg: TuyaMessage) -> Result<Self> {
        let payload = if msg.payload.is_empty() {
            Value::Object(Map::new())
        } else {
            match serde_json::from_slice(&msg.payload) {
                Ok(v) => v,
                Err(e) => {
                    return Err(match msg.retcode {
                        Some(rc) if rc != 0 => TuyaError::Protocol(format!(
                            "device returned code {}: {}",
                            rc,
                            String::from_utf8_lossy(&msg.payload)
                        )),
                        _ => TuyaError::Json(format!(
                            "{} (payload {})",
                            e,
                            hex::encode(&msg.payload)
                        )),
                    });
                }
            }
        };

        Ok(Self {
            seqno: msg.seqno,
            cmd: msg.cmd,
            retcode: msg.retcode,
            payload,
        })
    }

    /// The `dps` object of a status reply, if any.
    pub fn dps(&self) -> Option<&Map<String, Value>> {
        self.payload.get(KEY_DPS).and_then(Value::as_object)
    }
}

/// A connection to one device. Requests run strictly one at a time.
pub struct Session {
    device: Device,
    transport: Transport,
    crypto: SessionCrypto,
    seqno: u32,
    state: SessionState,
}

impl Session {
    /// Connect to the device and, for v3.4+, negotiate a session key.
    ///
    /// A failed negotiation closes the socket and is reported as
    /// [`TuyaError::Handshake`].
    pub async fn open(device: &Device) -> Result<Self> {
        let crypto = SessionCrypto::derive_key(device.local_key(), device.version())?;

        info!(
            "Connecting to device {} at {}:{}",
            device.id(),
            device.address(),
            device.port()
        );
        let mut transport =
            Transport::connect(device.address(), device.port(), device.connect_timeout()).await?;
        transport.set_io_timeout(device.timeout());

        let mut session = Self {
            device: device.clone(),
            transport,
            crypto,
            seqno: 1,
            state: SessionState::Disconnected,
        };

        if device.version() >= Version::V3_4 {
            session.state = SessionState::Handshaking;
            if let Err(e) = session.negotiate_session_key().await {
                session.transport.close().await;
                session.state = SessionState::Disconnected;
                warn!(
                    "Session key negotiation with {} failed: {} (check key or version)",
                    device.id(),
                    e
                );
                return Err(match e {
                    TuyaError::Handshake(_) => e,
                    other => TuyaError::Handshake(other.to_string()),
                });
            }
        }

        session.state = SessionState::Ready;
        debug!("Session with {} ready (v{})", device.id(), device.version());
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn version(&self) -> Version {
        self.crypto.version()
    }

    /// Sequence number the next request will carry.
    pub fn next_seqno(&self) -> u32 {
        self.seqno
    }

    /// Key protecting the current session (the local key before v3.4).
    pub fn session_key(&self) -> &[u8] {
        self.crypto.key()
    }

    /// Send a command and wait for its reply.
    ///
    /// `DpQuery`/`Control` are translated to their v3.4+ counterparts. The
    /// reply must carry the request's sequence number and command code.
    pub async fn request(
        &mut self,
        command: CommandType,
        data: Option<Value>,
    ) -> Result<CommandResponse> {
        let (cmd, payload) = build_payload(
            self.device.id(),
            self.version(),
            command,
            data,
            timestamp(),
        );
        debug!("request: cmd=0x{:02X}, payload={}", cmd, payload);

        let body = serde_json::to_vec(&payload)?;
        let msg = self.exchange(cmd, &body, cmd).await?;
        let response = CommandResponse::from_message(msg);
        if response.is_err() {
            self.fail().await;
        }
        response
    }

    /// Read and decode the next frame from the device.
    ///
    /// On timeout (or any other failure) the session becomes
    /// [`SessionState::Closed`].
    pub async fn receive(&mut self, deadline: Duration) -> Result<TuyaMessage> {
        self.ensure_open()?;
        let result = self.try_receive(deadline).await;
        if result.is_err() {
            self.fail().await;
        }
        result
    }

    /// Close the connection. Idempotent.
    pub async fn close(&mut self) {
        self.transport.close().await;
        self.state = SessionState::Closed;
    }

    async fn negotiate_session_key(&mut self) -> Result<()> {
        debug!("Starting session key negotiation with {}", self.device.id());

        let mut local_nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut local_nonce);

        let resp = self
            .exchange(
                CommandType::SessKeyNegStart as u32,
                &local_nonce,
                CommandType::SessKeyNegResp as u32,
            )
            .await?;

        if resp.payload.len() < NONCE_LEN + NONCE_HMAC_LEN {
            return Err(TuyaError::Handshake(format!(
                "negotiation response too short ({} bytes)",
                resp.payload.len()
            )));
        }
        let remote_nonce = &resp.payload[..NONCE_LEN];
        let remote_hmac = &resp.payload[NONCE_LEN..NONCE_LEN + NONCE_HMAC_LEN];

        let local_key = self.device.local_key().to_vec();
        verify_nonce_hmac(&local_key, &local_nonce, remote_hmac)?;
        let finish = nonce_hmac(&local_key, remote_nonce)?;
        self.send_frame(CommandType::SessKeyNegFinish as u32, &finish)
            .await?;

        self.crypto =
            SessionCrypto::negotiate(&local_key, self.version(), &local_nonce, remote_nonce)?;
        debug!("Session key negotiated with {}", self.device.id());
        Ok(())
    }

    async fn exchange(
        &mut self,
        cmd: u32,
        payload: &[u8],
        expected_cmd: u32,
    ) -> Result<TuyaMessage> {
        let seqno = self.send_frame(cmd, payload).await?;
        let resp = self.receive(self.device.timeout()).await?;

        if resp.seqno != seqno {
            self.fail().await;
            return Err(TuyaError::Protocol(format!(
                "expected reply to seqno {}, got seqno {}",
                seqno, resp.seqno
            )));
        }
        if resp.cmd != expected_cmd {
            self.fail().await;
            return Err(TuyaError::Protocol(format!(
                "expected command 0x{:02X}, got 0x{:02X}",
                expected_cmd, resp.cmd
            )));
        }
        if let Some(rc) = resp.retcode.filter(|&rc| rc != 0) {
            debug!("Device {} returned code {}", self.device.id(), rc);
        }
        Ok(resp)
    }

    async fn send_frame(&mut self, cmd: u32, payload: &[u8]) -> Result<u32> {
        self.ensure_open()?;
        let result = self.try_send(cmd, payload).await;
        if result.is_err() {
            self.fail().await;
        }
        result
    }

    async fn try_send(&mut self, cmd: u32, payload: &[u8]) -> Result<u32> {
        let seqno = self.seqno;
        let msg = TuyaMessage {
            seqno,
            cmd,
            payload: self.crypto.encode_payload(cmd, payload)?,
            prefix: self.crypto.prefix(),
            ..Default::default()
        };
        let packed = pack_message(&msg, self.crypto.frame_key())?;
        debug!(
            "Sending cmd=0x{:02X}, seqno={}, payload_len={}",
            cmd,
            seqno,
            msg.payload.len()
        );
        self.transport.send(&packed).await?;
        self.seqno = self.seqno.wrapping_add(1).max(1);
        Ok(seqno)
    }

    async fn try_receive(&mut self, deadline: Duration) -> Result<TuyaMessage> {
        let (packet, header) = self.transport.receive(deadline).await?;
        let mut msg = unpack_message(&packet, self.crypto.frame_key(), Some(header), Some(false))?;
        if !msg.payload.is_empty() {
            debug!("Raw payload (hex): {}", hex::encode(&msg.payload));
            let raw = std::mem::take(&mut msg.payload);
            msg.payload = self.crypto.decode_payload(msg.cmd, raw, msg.prefix)?;
        }
        debug!(
            "Received {} (0x{:02X}), seqno={}, retcode={:?}, payload_len={}",
            CommandType::from_u32(msg.cmd).map_or("Unknown", |c| c.name()),
            msg.cmd,
            msg.seqno,
            msg.retcode,
            msg.payload.len()
        );
        Ok(msg)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            SessionState::Handshaking | SessionState::Ready if !self.transport.is_closed() => {
                Ok(())
            }
            state => Err(TuyaError::Connect(format!("session is {:?}", state))),
        }
    }

    async fn fail(&mut self) {
        self.close().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.device.id())
            .field("peer", &self.transport.peer())
            .field("version", &self.version())
            .field("seqno", &self.seqno)
            .field("state", &self.state)
            .finish()
    }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Build the JSON body for `command`, returning the wire command code.
fn build_payload(
    id: &str,
    version: Version,
    command: CommandType,
    data: Option<Value>,
    t: u64,
) -> (u32, Value) {
    let command = match (version, command) {
        (v, CommandType::Control) if v >= Version::V3_4 => CommandType::ControlNew,
        (v, CommandType::DpQuery) if v >= Version::V3_4 => CommandType::DpQueryNew,
        // 3.2 firmware rejects DP_QUERY; status is requested through CONTROL_NEW
        (Version::V3_2, CommandType::DpQuery) => CommandType::ControlNew,
        (_, other) => other,
    };
    let data = match (version, command, data) {
        (Version::V3_2, CommandType::ControlNew, None) => {
            Some(json!({ RELAY_DP.to_string(): null }))
        }
        (_, _, data) => data,
    };

    let mut payload = Map::new();
    if version >= Version::V3_4 && command == CommandType::ControlNew {
        payload.insert(KEY_PROTOCOL.into(), 5.into());
        payload.insert(KEY_T.into(), t.into());
        let mut data_obj = Map::new();
        if let Some(d) = data {
            data_obj.insert(KEY_DPS.into(), d);
        }
        payload.insert(KEY_DATA.into(), Value::Object(data_obj));
    } else {
        payload.insert(KEY_GW_ID.into(), id.into());
        payload.insert(KEY_DEV_ID.into(), id.into());
        payload.insert(KEY_UID.into(), id.into());
        payload.insert(KEY_T.into(), t.to_string().into());
        if let Some(d) = data {
            payload.insert(KEY_DPS.into(), d);
        }
    }

    (command as u32, Value::Object(payload))
}
