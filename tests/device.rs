//! End-to-end tests against an in-process mock device.
//!
//! The mock speaks the device side of the protocol with the crate's own frame
//! codec and session crypto: it answers the v3.4/v3.5 key negotiation, keeps a
//! DPS map, applies control commands and answers status queries.

use serde_json::{Map, Value, json};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tuyactl::crypto::{SessionCrypto, nonce_hmac, verify_nonce_hmac};
use tuyactl::protocol::{TuyaMessage, pack_message, unpack_message};
use tuyactl::status::{self, extract};
use tuyactl::transport::Transport;
use tuyactl::{CommandType, Device, SessionState, TuyaError, Version};

const DEVICE_ID: &str = "b654a3f895r5y75a54fqug";
const LOCAL_KEY: &[u8] = b"0123456789abcdef";
const WRONG_KEY: &[u8] = b"fedcba9876543210";

#[derive(Clone, Copy, Default)]
enum Behaviour {
    #[default]
    Normal,
    /// Reply to commands with a shifted sequence number
    WrongSeqno,
    /// Reply to commands with a STATUS push instead of the matching command
    WrongCmd,
    /// Read requests but never answer
    Silent,
}

#[derive(Clone)]
struct MockDevice {
    version: Version,
    behaviour: Behaviour,
    dps: Arc<Mutex<Map<String, Value>>>,
    session_keys: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockDevice {
    fn new(version: Version) -> Self {
        let mut dps = Map::new();
        dps.insert("1".into(), json!(false));
        dps.insert("9".into(), json!(0));
        Self {
            version,
            behaviour: Behaviour::Normal,
            dps: Arc::new(Mutex::new(dps)),
            session_keys: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn with_behaviour(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    async fn spawn(self) -> SocketAddr {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mock = self.clone();
                tokio::spawn(async move {
                    let _ = mock.serve(stream).await;
                });
            }
        });
        addr
    }

    async fn serve(&self, stream: TcpStream) -> tuyactl::error::Result<()> {
        let mut transport = Transport::from_stream(stream, Duration::from_secs(5));
        let mut crypto = SessionCrypto::derive_key(LOCAL_KEY, self.version)?;
        let mut nonces: Option<(Vec<u8>, Vec<u8>)> = None;

        loop {
            let (packet, header) = transport.receive(Duration::from_secs(5)).await?;
            let msg = unpack_message(&packet, crypto.frame_key(), Some(header), Some(true))?;
            let plain = crypto.decode_payload(msg.cmd, msg.payload, msg.prefix)?;

            match CommandType::from_u32(msg.cmd) {
                Some(CommandType::SessKeyNegStart) => {
                    let remote_nonce = b"device-nonce-016".to_vec();
                    let mut body = remote_nonce.clone();
                    body.extend(nonce_hmac(LOCAL_KEY, &plain)?);
                    self.reply(
                        &mut transport,
                        &crypto,
                        msg.seqno,
                        CommandType::SessKeyNegResp,
                        0,
                        &body,
                    )
                    .await?;
                    nonces = Some((plain, remote_nonce));
                }
                Some(CommandType::SessKeyNegFinish) => {
                    let (local, remote) = nonces.take().expect("finish before start");
                    verify_nonce_hmac(LOCAL_KEY, &remote, &plain)?;
                    crypto = SessionCrypto::negotiate(LOCAL_KEY, self.version, &local, &remote)?;
                    self.session_keys.lock().unwrap().push(crypto.key().to_vec());
                }
                Some(CommandType::DpQuery) if self.version == Version::V3_2 => {
                    // 3.2 firmware only answers status requests sent as CONTROL_NEW
                    self.reply(
                        &mut transport,
                        &crypto,
                        msg.seqno,
                        CommandType::DpQuery,
                        1,
                        b"json obj data unvalid",
                    )
                    .await?;
                }
                Some(cmd @ (CommandType::DpQuery | CommandType::DpQueryNew)) => {
                    let body = json!({
                        "devId": DEVICE_ID,
                        "dps": Value::Object(self.dps.lock().unwrap().clone()),
                    });
                    self.answer(&mut transport, &crypto, msg.seqno, cmd, &body).await?;
                }
                Some(cmd @ (CommandType::Control | CommandType::ControlNew)) => {
                    let request: Value = serde_json::from_slice(&plain)?;
                    let update = request
                        .pointer("/data/dps")
                        .or_else(|| request.get("dps"))
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    if !update.is_empty() && update.values().all(Value::is_null) {
                        // null values ask for the current state of those points
                        let body = {
                            let current = self.dps.lock().unwrap();
                            let requested: Map<String, Value> = update
                                .keys()
                                .filter_map(|k| current.get(k).map(|v| (k.clone(), v.clone())))
                                .collect();
                            json!({ "devId": DEVICE_ID, "dps": requested })
                        };
                        self.answer(&mut transport, &crypto, msg.seqno, cmd, &body).await?;
                        continue;
                    }
                    self.dps.lock().unwrap().extend(update);
                    // empty acknowledgement
                    self.answer(&mut transport, &crypto, msg.seqno, cmd, &Value::Null).await?;
                }
                _ => {}
            }
        }
    }

    async fn answer(
        &self,
        transport: &mut Transport,
        crypto: &SessionCrypto,
        seqno: u32,
        cmd: CommandType,
        body: &Value,
    ) -> tuyactl::error::Result<()> {
        let (seqno, cmd) = match self.behaviour {
            Behaviour::Normal => (seqno, cmd),
            Behaviour::WrongSeqno => (seqno + 100, cmd),
            Behaviour::WrongCmd => (seqno, CommandType::Status),
            Behaviour::Silent => return Ok(()),
        };
        let bytes = if body.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(body)?
        };
        self.reply(transport, crypto, seqno, cmd, 0, &bytes).await
    }

    async fn reply(
        &self,
        transport: &mut Transport,
        crypto: &SessionCrypto,
        seqno: u32,
        cmd: CommandType,
        retcode: u32,
        plain: &[u8],
    ) -> tuyactl::error::Result<()> {
        let payload = if plain.is_empty() {
            Vec::new()
        } else {
            crypto.encode_payload(cmd as u32, plain)?
        };
        let msg = TuyaMessage {
            seqno,
            cmd: cmd as u32,
            retcode: Some(retcode),
            payload,
            prefix: crypto.prefix(),
            iv: None,
        };
        transport
            .send(&pack_message(&msg, crypto.frame_key())?)
            .await
    }
}

fn device(addr: SocketAddr, key: &[u8], version: Version) -> Device {
    Device::builder(DEVICE_ID, key)
        .address(addr.ip().to_string())
        .port(addr.port())
        .version(version)
        .connect_timeout(Duration::from_secs(2))
        .timeout(Duration::from_millis(500))
        .build()
}

#[tokio::test]
async fn relay_on_then_status_reads_true_v34() {
    let addr = MockDevice::new(Version::V3_4).spawn().await;
    let device = device(addr, LOCAL_KEY, Version::V3_4);

    let ack = device.set_relay(true).await.unwrap();
    assert_eq!(ack.cmd, CommandType::ControlNew as u32);
    assert_eq!(ack.retcode, Some(0));

    let response = device.status().await.unwrap();
    assert_eq!(response.cmd, CommandType::DpQueryNew as u32);
    assert_eq!(extract("dps.1", &response).unwrap(), json!(true));
    assert_eq!(extract("", &response).unwrap(), response.payload);
}

#[tokio::test]
async fn relay_round_trip_for_every_version() {
    for version in [
        Version::V3_1,
        Version::V3_2,
        Version::V3_3,
        Version::V3_4,
        Version::V3_5,
    ] {
        let addr = MockDevice::new(version).spawn().await;
        let device = device(addr, LOCAL_KEY, version);

        device.turn_on().await.unwrap();
        let on = device.status().await.unwrap();
        assert!(status::truthy(&extract("dps.1", &on).unwrap()), "v{}", version);

        device.turn_off().await.unwrap();
        let off = device.status().await.unwrap();
        assert_eq!(extract("dps.1", &off).unwrap(), json!(false), "v{}", version);
        if version == Version::V3_2 {
            // only the relay point is requested
            assert_eq!(on.cmd, CommandType::ControlNew as u32);
            assert_eq!(on.dps().unwrap().len(), 1);
        } else {
            assert_eq!(on.dps().unwrap().get("9"), Some(&json!(0)));
        }
    }
}

#[tokio::test]
async fn set_dps_updates_several_points() {
    let addr = MockDevice::new(Version::V3_3).spawn().await;
    let device = device(addr, LOCAL_KEY, Version::V3_3);

    device.set_dps(json!({"1": true, "9": 120})).await.unwrap();
    let response = device.status().await.unwrap();
    assert_eq!(extract("dps.9", &response).unwrap(), json!(120));
    assert!(matches!(
        extract("dps.42", &response),
        Err(TuyaError::PathNotFound { .. })
    ));
}

#[tokio::test]
async fn one_session_serves_several_requests() {
    let addr = MockDevice::new(Version::V3_5).spawn().await;
    let device = device(addr, LOCAL_KEY, Version::V3_5);

    let mut session = device.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    // start + finish of the negotiation used seqno 1 and 2
    assert_eq!(session.next_seqno(), 3);

    let first = session.request(CommandType::DpQuery, None).await.unwrap();
    let second = session
        .request(CommandType::Control, Some(json!({"1": true})))
        .await
        .unwrap();
    assert!(second.seqno > first.seqno);
    assert_eq!(session.state(), SessionState::Ready);

    session.close().await;
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn handshakes_never_reuse_session_keys() {
    let mock = MockDevice::new(Version::V3_4);
    let keys = mock.session_keys.clone();
    let addr = mock.spawn().await;
    let device = device(addr, LOCAL_KEY, Version::V3_4);

    let first = device.connect().await.unwrap();
    let second = device.connect().await.unwrap();
    assert_ne!(first.session_key(), second.session_key());
    assert_ne!(first.session_key(), LOCAL_KEY);

    // both sides derived the same keys
    tokio::time::sleep(Duration::from_millis(50)).await;
    let recorded = keys.lock().unwrap().clone();
    assert!(recorded.contains(&first.session_key().to_vec()));
    assert!(recorded.contains(&second.session_key().to_vec()));
}

#[tokio::test]
async fn mismatched_sequence_number_is_protocol_error() {
    let addr = MockDevice::new(Version::V3_3)
        .with_behaviour(Behaviour::WrongSeqno)
        .spawn()
        .await;
    let device = device(addr, LOCAL_KEY, Version::V3_3);

    let mut session = device.connect().await.unwrap();
    let err = session
        .request(CommandType::DpQuery, None)
        .await
        .unwrap_err();
    assert!(matches!(err, TuyaError::Protocol(_)), "{:?}", err);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn reply_with_other_command_is_protocol_error() {
    let addr = MockDevice::new(Version::V3_3)
        .with_behaviour(Behaviour::WrongCmd)
        .spawn()
        .await;
    let device = device(addr, LOCAL_KEY, Version::V3_3);

    let mut session = device.connect().await.unwrap();
    let err = session
        .request(CommandType::DpQuery, None)
        .await
        .unwrap_err();
    assert!(
        matches!(&err, TuyaError::Protocol(m) if m.contains("0x0A") && m.contains("0x08")),
        "{:?}",
        err
    );
    assert_eq!(session.state(), SessionState::Closed);
}

/// Accepts one connection, reads the nonce frame and answers it with `reply`
/// (or hangs up when `reply` is `None`). Resolves to what the next read sees.
async fn spawn_broken_handshake(
    reply: Option<&'static [u8]>,
) -> (SocketAddr, JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        assert!(stream.read(&mut buf).await.unwrap() > 0);
        match reply {
            Some(bytes) => {
                stream.write_all(bytes).await.unwrap();
                timeout(Duration::from_secs(5), stream.read(&mut buf))
                    .await
                    .expect("client kept the socket open")
                    .unwrap()
            }
            None => 0,
        }
    });
    (addr, server)
}

#[tokio::test]
async fn garbage_during_negotiation_fails_and_releases_socket() {
    let (addr, server) = spawn_broken_handshake(Some(&b"\x01\x02junk!!"[..])).await;
    let device = device(addr, LOCAL_KEY, Version::V3_4);

    let err = device.connect().await.unwrap_err();
    assert!(matches!(err, TuyaError::Handshake(_)), "{:?}", err);
    assert_eq!(err.code(), 914);
    // EOF on the device side
    assert_eq!(server.await.unwrap(), 0);
}

#[tokio::test]
async fn hangup_during_negotiation_is_handshake_error() {
    let (addr, server) = spawn_broken_handshake(None).await;
    let device = device(addr, LOCAL_KEY, Version::V3_5);

    let err = device.status().await.unwrap_err();
    assert!(matches!(err, TuyaError::Handshake(_)), "{:?}", err);
    server.await.unwrap();
}

#[tokio::test]
async fn wrong_key_fails_the_handshake() {
    for version in [Version::V3_4, Version::V3_5] {
        let addr = MockDevice::new(version).spawn().await;
        let device = device(addr, WRONG_KEY, version);

        let err = device.status().await.unwrap_err();
        assert!(matches!(err, TuyaError::Handshake(_)), "v{}: {:?}", version, err);
        assert_eq!(err.code(), 914);
    }
}

#[tokio::test]
async fn wrong_key_on_legacy_device_is_not_silently_accepted() {
    let addr = MockDevice::new(Version::V3_3).spawn().await;
    let device = device(addr, WRONG_KEY, Version::V3_3);

    // the mock cannot decrypt the query and hangs up
    assert!(device.status().await.is_err());
}

#[tokio::test]
async fn silent_device_times_out() {
    let addr = MockDevice::new(Version::V3_3)
        .with_behaviour(Behaviour::Silent)
        .spawn()
        .await;
    let device = device(addr, LOCAL_KEY, Version::V3_3);

    let mut session = device.connect().await.unwrap();
    let err = session
        .request(CommandType::DpQuery, None)
        .await
        .unwrap_err();
    assert_eq!(err, TuyaError::Timeout);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn unreachable_device_is_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = device(addr, LOCAL_KEY, Version::V3_4)
        .set_relay(true)
        .await
        .unwrap_err();
    assert!(matches!(err, TuyaError::Connect(_)), "{:?}", err);
}

#[tokio::test]
async fn independent_devices_run_concurrently() {
    let a = device(
        MockDevice::new(Version::V3_4).spawn().await,
        LOCAL_KEY,
        Version::V3_4,
    );
    let b = device(
        MockDevice::new(Version::V3_3).spawn().await,
        LOCAL_KEY,
        Version::V3_3,
    );

    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.set_relay(true).await.and(a.status().await) }),
        tokio::spawn(async move { b.status().await })
    );
    assert_eq!(extract("dps.1", &ra.unwrap().unwrap()).unwrap(), json!(true));
    assert_eq!(extract("dps.1", &rb.unwrap().unwrap()).unwrap(), json!(false));
}
