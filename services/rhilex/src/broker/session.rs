//! Per-connection MQTT state machine

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use errors::{RhilexError, RhilexResult};
use parking_lot::Mutex;
use rumqttc::mqttbytes::v4::{
    self, ConnAck, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, SubAck, SubscribeReasonCode,
    UnsubAck,
};
use rumqttc::mqttbytes::{self, QoS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Broker, Session};

const MAX_PACKET_SIZE: usize = 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_CAPACITY: usize = 256;
const PINGRESP: [u8; 2] = [0xD0, 0x00];

fn codec_error(e: mqttbytes::Error) -> RhilexError {
    RhilexError::Mqtt(format!("{:?}", e))
}

fn encode<F>(write: F) -> RhilexResult<BytesMut>
where
    F: FnOnce(&mut BytesMut) -> Result<usize, mqttbytes::Error>,
{
    let mut buf = BytesMut::new();
    write(&mut buf).map_err(codec_error)?;
    Ok(buf)
}

async fn read_packet(reader: &mut OwnedReadHalf, buf: &mut BytesMut) -> RhilexResult<Packet> {
    loop {
        match v4::read(buf, MAX_PACKET_SIZE) {
            Ok(packet) => return Ok(packet),
            Err(mqttbytes::Error::InsufficientBytes(_)) => {},
            Err(e) => return Err(codec_error(e)),
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(RhilexError::Communication("connection closed".to_string()));
        }
    }
}

pub(super) async fn serve(broker: Arc<Broker>, stream: TcpStream, peer: SocketAddr) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(4096);

    let connect = match tokio::time::timeout(CONNECT_TIMEOUT, read_packet(&mut reader, &mut buf)).await {
        Ok(Ok(Packet::Connect(connect))) => connect,
        Ok(Ok(_)) => {
            debug!("Mqtt client {} sent a packet before CONNECT", peer);
            return;
        },
        Ok(Err(e)) => {
            debug!("Mqtt client {} dropped during connect: {}", peer, e);
            return;
        },
        Err(_) => {
            debug!("Mqtt client {} connect timeout", peer);
            return;
        },
    };

    let (username, password) = connect
        .login
        .as_ref()
        .map(|l| (l.username.clone(), l.password.clone()))
        .unwrap_or_default();
    let client_id = if connect.client_id.is_empty() {
        format!("auto-{}", uuid::Uuid::new_v4().simple())
    } else {
        connect.client_id.clone()
    };

    if !broker.authenticate(&client_id, &username, &password) {
        debug!("Mqtt client {} rejected, bad credentials", client_id);
        if let Ok(nack) = encode(|b| ConnAck::new(ConnectReturnCode::BadUserNamePassword, false).write(b)) {
            let _ = writer.write_all(&nack).await;
        }
        return;
    }

    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let session = Arc::new(Session {
        conn_id: broker.next_conn_id(),
        client_id,
        username,
        remote: peer,
        clean_session: connect.clean_session,
        topics: Mutex::new(Vec::new()),
        outbound: tx,
        kick: CancellationToken::new(),
    });

    let ack = match encode(|b| ConnAck::new(ConnectReturnCode::Success, false).write(b)) {
        Ok(ack) => ack,
        Err(e) => {
            debug!("Encode CONNACK failed: {}", e);
            return;
        },
    };
    broker.attach(Arc::clone(&session));
    if writer.write_all(&ack).await.is_err() {
        broker.detach(&session);
        return;
    }

    debug!("Mqtt Client Connected:({}), Addr:({})", session.client_id, peer);
    broker.emit(&session, "connect", "", b"");

    if let Err(e) = run(&broker, &session, &mut reader, &mut writer, &mut buf, rx).await {
        debug!("Mqtt client {} closed: {}", session.client_id, e);
    }

    broker.detach(&session);
    debug!("Mqtt Client Disconnect:({}), Addr:({})", session.client_id, peer);
    broker.emit(&session, "disconnect", "", b"");
}

async fn run(
    broker: &Broker,
    session: &Session,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    buf: &mut BytesMut,
    mut rx: mpsc::Receiver<v4::Publish>,
) -> RhilexResult<()> {
    loop {
        let packet = tokio::select! {
            _ = broker.token.cancelled() => return Ok(()),
            _ = session.kick.cancelled() => return Ok(()),
            Some(message) = rx.recv() => {
                writer.write_all(&encode(|b| message.write(b))?).await?;
                continue;
            },
            packet = read_packet(reader, buf) => packet?,
        };

        match packet {
            Packet::Publish(publish) => {
                match publish.qos {
                    QoS::AtMostOnce => {},
                    QoS::AtLeastOnce => {
                        writer.write_all(&encode(|b| PubAck::new(publish.pkid).write(b))?).await?;
                    },
                    QoS::ExactlyOnce => {
                        writer.write_all(&encode(|b| PubRec::new(publish.pkid).write(b))?).await?;
                    },
                }
                broker.emit(session, "publish", &publish.topic, &publish.payload);
                broker.route(&publish);
            },
            Packet::PubRel(rel) => {
                writer.write_all(&encode(|b| PubComp::new(rel.pkid).write(b))?).await?;
            },
            Packet::Subscribe(subscribe) => {
                let mut codes = Vec::with_capacity(subscribe.filters.len());
                for filter in &subscribe.filters {
                    {
                        let mut topics = session.topics.lock();
                        if !topics.contains(&filter.path) {
                            topics.push(filter.path.clone());
                        }
                    }
                    codes.push(SubscribeReasonCode::Success(QoS::AtMostOnce));
                    debug!(
                        "Mqtt Client Subscribe, ClientId:({}),Topic: ({})",
                        session.client_id, filter.path
                    );
                    broker.emit(session, "subscribe", &filter.path, b"");
                }
                let ack = SubAck::new(subscribe.pkid, codes);
                writer.write_all(&encode(|b| ack.write(b))?).await?;
            },
            Packet::Unsubscribe(unsubscribe) => {
                session
                    .topics
                    .lock()
                    .retain(|t| !unsubscribe.topics.contains(t));
                writer
                    .write_all(&encode(|b| UnsubAck::new(unsubscribe.pkid).write(b))?)
                    .await?;
            },
            Packet::PingReq { .. } => writer.write_all(&PINGRESP).await?,
            Packet::Disconnect { .. } => return Ok(()),
            other => debug!("Mqtt client {} sent unexpected {:?}", session.client_id, other),
        }
    }
}
