//! In-process fake MQTT broker for integration tests
//!
//! Speaks the server side of the exchange one scripted step at a time. The
//! library codec only covers the client's half of the protocol, so the
//! broker-side packets are framed here on top of its primitives.

#![allow(dead_code)]

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use radiomq::codec::{
    read_binary, read_string, read_u16, read_variable_int, write_string, write_variable_int,
    Decoder, Encoder,
};
use radiomq::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Subscription, PROTOCOL_LEVEL_V311,
};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Server end of one client connection
pub struct BrokerConn {
    stream: TcpStream,
    buf: BytesMut,
    decoder: Decoder,
    encoder: Encoder,
}

impl BrokerConn {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(STEP_TIMEOUT, listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        Self {
            stream,
            buf: BytesMut::with_capacity(1024),
            decoder: Decoder::new(),
            encoder: Encoder::new(),
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        let mut out = BytesMut::new();
        encode_server(&self.encoder, &packet, &mut out);
        self.stream.write_all(&out).await.unwrap();
    }

    pub async fn recv(&mut self) -> Packet {
        timeout(STEP_TIMEOUT, self.read_packet())
            .await
            .expect("no packet from client")
            .expect("client closed the connection")
    }

    /// Next packet, or `None` once the client closed the stream
    pub async fn read_packet(&mut self) -> Option<Packet> {
        loop {
            if let Some((packet, used)) = decode_client(&self.decoder, &self.buf) {
                self.buf.advance(used);
                return Some(packet);
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Read CONNECT and answer with the given return code
    pub async fn accept_connect(&mut self, code: ConnectReturnCode) -> Box<Connect> {
        let connect = match self.recv().await {
            Packet::Connect(connect) => connect,
            other => panic!("expected CONNECT, got {:?}", other),
        };
        self.send(Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: code,
        }))
        .await;
        connect
    }

    /// Read SUBSCRIBE and answer with the given return code
    pub async fn accept_subscribe(&mut self, code: SubscribeReturnCode) -> Subscribe {
        let subscribe = match self.recv().await {
            Packet::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        };
        self.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes: vec![code],
        }))
        .await;
        subscribe
    }

    /// Accept CONNECT and grant the SUBSCRIBE that follows
    pub async fn handshake(&mut self) -> Subscribe {
        self.accept_connect(ConnectReturnCode::Accepted).await;
        self.accept_subscribe(SubscribeReturnCode::Granted(QoS::AtLeastOnce))
            .await
    }

    pub async fn publish(&mut self, topic: &str, payload: impl Into<Bytes>, qos: QoS, id: u16) {
        let packet_id = (qos != QoS::AtMostOnce).then_some(id);
        self.send(Packet::Publish(Publish {
            qos,
            topic: topic.to_string(),
            packet_id,
            payload: payload.into(),
            ..Default::default()
        }))
        .await;
    }
}

/// Frame a broker-to-client packet
fn encode_server(encoder: &Encoder, packet: &Packet, out: &mut BytesMut) {
    match packet {
        Packet::ConnAck(ack) => {
            out.put_slice(&[0x20, 0x02, ack.session_present as u8, ack.return_code as u8]);
        }
        Packet::SubAck(ack) => {
            out.put_u8(0x90);
            write_variable_int(out, (2 + ack.return_codes.len()) as u32).unwrap();
            out.put_u16(ack.packet_id);
            for code in &ack.return_codes {
                out.put_u8(code.to_u8());
            }
        }
        Packet::Publish(publish) => {
            let id = publish.packet_id.filter(|_| publish.qos != QoS::AtMostOnce);
            let remaining = 2 + publish.topic.len() + id.map_or(0, |_| 2) + publish.payload.len();
            out.put_u8(0x30 | ((publish.qos as u8) << 1) | publish.retain as u8);
            write_variable_int(out, remaining as u32).unwrap();
            write_string(out, &publish.topic).unwrap();
            if let Some(id) = id {
                out.put_u16(id);
            }
            out.put_slice(&publish.payload);
        }
        Packet::PubRel(id) => {
            out.put_slice(&[0x62, 0x02]);
            out.put_u16(*id);
        }
        Packet::PingResp => out.put_slice(&[0xD0, 0x00]),
        other => encoder.encode(other, out).unwrap(),
    }
}

/// Parse one client-to-server packet, `None` until it is complete
fn decode_client(decoder: &Decoder, buf: &[u8]) -> Option<(Packet, usize)> {
    if buf.len() < 2 {
        return None;
    }
    let (remaining, len_bytes) = match read_variable_int(&buf[1..]) {
        Ok(r) => r,
        Err(DecodeError::InsufficientData) => return None,
        Err(e) => panic!("bad remaining length from client: {}", e),
    };
    let total = 1 + len_bytes + remaining as usize;
    if buf.len() < total {
        return None;
    }
    let body = &buf[1 + len_bytes..total];

    let packet = match buf[0] {
        0x10 => parse_connect(body),
        0x82 => parse_subscribe(body),
        _ => return decoder.decode(buf).expect("malformed packet from client"),
    };
    Some((packet, total))
}

fn parse_connect(body: &[u8]) -> Packet {
    let (name, mut pos) = read_string(body).unwrap();
    assert_eq!(name, "MQTT");
    assert_eq!(body[pos], PROTOCOL_LEVEL_V311);
    let flags = body[pos + 1];
    let keep_alive = read_u16(&body[pos + 2..]).unwrap();
    pos += 4;

    let (client_id, len) = read_string(&body[pos..]).unwrap();
    pos += len;

    let mut username = None;
    if flags & 0x80 != 0 {
        let (name, len) = read_string(&body[pos..]).unwrap();
        pos += len;
        username = Some(name.to_string());
    }
    let mut password = None;
    if flags & 0x40 != 0 {
        let (data, len) = read_binary(&body[pos..]).unwrap();
        pos += len;
        password = Some(Bytes::copy_from_slice(data));
    }
    assert_eq!(pos, body.len(), "trailing bytes after CONNECT");

    Packet::Connect(Box::new(Connect {
        client_id: client_id.to_string(),
        clean_session: flags & 0x02 != 0,
        keep_alive,
        username,
        password,
    }))
}

fn parse_subscribe(body: &[u8]) -> Packet {
    let packet_id = read_u16(body).unwrap();
    let mut pos = 2;
    let mut subscriptions = Vec::new();
    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..]).unwrap();
        pos += len;
        subscriptions.push(Subscription {
            filter: filter.to_string(),
            qos: QoS::from_u8(body[pos]).expect("bad requested QoS"),
        });
        pos += 1;
    }
    Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    })
}
