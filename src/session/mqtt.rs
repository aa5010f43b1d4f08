//! MQTT v3.1.1 client session over TCP
//!
//! Speaks just enough of the protocol to keep one subscription alive:
//! CONNECT/CONNACK, SUBSCRIBE/SUBACK, inbound PUBLISH at QoS 0-2 with the
//! matching acknowledgements, and PINGREQ/PINGRESP keep-alive.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{interval_at, timeout, timeout_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{BrokerSession, ConnectOptions, InboundMessage, SessionError};
use crate::codec::{Decoder, Encoder, OversizedPublish};
use crate::protocol::{
    Connect, DecodeError, Packet, Publish, QoS, Subscribe, SubscribeReturnCode, Subscription,
};

/// One unit read off the broker stream
enum Inbound {
    Packet(Packet),
    /// PUBLISH over the packet size limit; its payload is skipped unread
    Oversized(OversizedPublish),
}

/// One established TCP connection to the broker
struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// PINGREQ schedule; `None` when keep-alive is disabled
    keepalive: Option<Interval>,
    ping_outstanding: bool,
    /// Payload bytes of an oversized PUBLISH still to be thrown away
    discard: usize,
}

impl Connection {
    fn new(stream: TcpStream, keep_alive: Duration) -> Self {
        let keepalive = (!keep_alive.is_zero()).then(|| {
            let mut timer = interval_at(Instant::now() + keep_alive, keep_alive);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(256),
            keepalive,
            ping_outstanding: false,
            discard: 0,
        }
    }

    async fn send(&mut self, encoder: &Encoder, packet: &Packet) -> Result<(), SessionError> {
        self.write_buf.clear();
        encoder.encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Pop the next complete packet out of the read buffer
    fn take_packet(&mut self, decoder: &Decoder) -> Result<Option<Inbound>, SessionError> {
        self.skip_discarded();
        if self.discard > 0 {
            return Ok(None);
        }

        match decoder.decode(&self.read_buf) {
            Ok(Some((packet, used))) => {
                self.read_buf.advance(used);
                Ok(Some(Inbound::Packet(packet)))
            }
            Ok(None) => Ok(None),
            Err(DecodeError::PacketTooLarge) => {
                match decoder.decode_oversized_publish(&self.read_buf)? {
                    Some(publish) => {
                        self.read_buf.advance(publish.header_len);
                        self.discard = publish.payload_len;
                        self.skip_discarded();
                        Ok(Some(Inbound::Oversized(publish)))
                    }
                    None => Ok(None),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn skip_discarded(&mut self) {
        let n = self.discard.min(self.read_buf.len());
        self.read_buf.advance(n);
        self.discard -= n;
    }

    async fn read_packet(&mut self, decoder: &Decoder) -> Result<Inbound, SessionError> {
        loop {
            if let Some(packet) = self.take_packet(decoder)? {
                return Ok(packet);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            ensure_open(n)?;
        }
    }

    /// Wait until more bytes arrive, sending PINGREQ when keep-alive is due.
    ///
    /// Only awaits cancel-safe reads and timer ticks before a ping is due,
    /// so the caller may drop this future while it is idle.
    async fn wait_for_input(&mut self, encoder: &Encoder) -> Result<(), SessionError> {
        let ping_due = match self.keepalive.as_mut() {
            None => {
                let n = self.stream.read_buf(&mut self.read_buf).await?;
                ensure_open(n)?;
                false
            }
            Some(keepalive) => {
                tokio::select! {
                    biased;
                    result = self.stream.read_buf(&mut self.read_buf) => {
                        ensure_open(result?)?;
                        false
                    }
                    _ = keepalive.tick() => true,
                }
            }
        };

        if ping_due {
            if self.ping_outstanding {
                return Err(SessionError::ConnectionLost(
                    "No PINGRESP within keep-alive interval".to_string(),
                ));
            }
            self.ping_outstanding = true;
            self.send(encoder, &Packet::PingReq).await?;
            debug!("PINGREQ sent");
        }
        Ok(())
    }
}

fn ensure_open(n: usize) -> Result<(), SessionError> {
    if n == 0 {
        Err(SessionError::ConnectionLost("Connection closed".to_string()))
    } else {
        Ok(())
    }
}

fn into_message(publish: Publish) -> InboundMessage {
    InboundMessage {
        topic: publish.topic,
        payload: publish.payload,
        qos: publish.qos,
        retain: publish.retain,
    }
}

/// MQTT v3.1.1 broker session
pub struct MqttSession {
    options: ConnectOptions,
    encoder: Encoder,
    decoder: Decoder,
    connection: Option<Connection>,
    /// Publications that arrived while waiting for a SUBACK
    pending: VecDeque<InboundMessage>,
    /// QoS 2 packet ids already delivered and not yet released
    awaiting_rel: HashSet<u16>,
    next_packet_id: u16,
}

impl MqttSession {
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            options,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            connection: None,
            pending: VecDeque::new(),
            awaiting_rel: HashSet::new(),
            next_packet_id: 1,
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }

    async fn open(&mut self) -> Result<(), SessionError> {
        let options = &self.options;
        debug!("Connecting to {}", options.address);

        let stream = timeout(
            options.connect_timeout,
            TcpStream::connect(options.address.as_str()),
        )
        .await
        .map_err(|_| SessionError::Timeout)??;
        stream.set_nodelay(true)?;

        let mut connection = Connection::new(stream, options.keep_alive);

        let connect = Packet::Connect(Box::new(Connect {
            client_id: options.client_id.clone(),
            clean_session: options.clean_session,
            keep_alive: options.keep_alive.as_secs().min(u16::MAX as u64) as u16,
            username: options.username.clone(),
            password: options.password.as_ref().map(|p| Bytes::from(p.clone())),
        }));
        connection.send(&self.encoder, &connect).await?;

        let packet = timeout(
            options.connect_timeout,
            connection.read_packet(&self.decoder),
        )
        .await
        .map_err(|_| SessionError::Timeout)??;

        match packet {
            Inbound::Packet(Packet::ConnAck(ack)) if ack.return_code.is_accepted() => {
                info!(
                    "Connected to {} as '{}' (session_present={})",
                    options.address, options.client_id, ack.session_present
                );
            }
            Inbound::Packet(Packet::ConnAck(ack)) => {
                return Err(SessionError::Refused(ack.return_code))
            }
            _ => return Err(SessionError::UnexpectedPacket("expected CONNACK")),
        }

        if options.clean_session {
            self.awaiting_rel.clear();
        }
        self.connection = Some(connection);
        Ok(())
    }

    /// Acknowledge an inbound packet and return the publication it carries
    async fn process_packet(
        connection: &mut Connection,
        encoder: &Encoder,
        awaiting_rel: &mut HashSet<u16>,
        inbound: Inbound,
    ) -> Result<Option<InboundMessage>, SessionError> {
        let packet = match inbound {
            Inbound::Packet(packet) => packet,
            Inbound::Oversized(publish) => {
                Self::drop_oversized(connection, encoder, awaiting_rel, publish).await?;
                return Ok(None);
            }
        };

        match packet {
            Packet::Publish(publish) => match (publish.qos, publish.packet_id) {
                (QoS::AtMostOnce, _) => Ok(Some(into_message(publish))),
                (QoS::AtLeastOnce, Some(id)) => {
                    connection.send(encoder, &Packet::PubAck(id)).await?;
                    Ok(Some(into_message(publish)))
                }
                (QoS::ExactlyOnce, Some(id)) => {
                    connection.send(encoder, &Packet::PubRec(id)).await?;
                    if awaiting_rel.insert(id) {
                        Ok(Some(into_message(publish)))
                    } else {
                        debug!("Duplicate QoS 2 PUBLISH {} ignored", id);
                        Ok(None)
                    }
                }
                _ => Err(SessionError::UnexpectedPacket("PUBLISH without packet id")),
            },
            Packet::PubRel(id) => {
                awaiting_rel.remove(&id);
                connection.send(encoder, &Packet::PubComp(id)).await?;
                Ok(None)
            }
            Packet::PingResp => {
                connection.ping_outstanding = false;
                Ok(None)
            }
            Packet::Disconnect => Err(SessionError::ConnectionLost(
                "Broker sent DISCONNECT".to_string(),
            )),
            Packet::SubAck(_) | Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubComp(_) => {
                debug!("Ignoring stray packet type {}", packet.packet_type());
                Ok(None)
            }
            Packet::Connect(_) | Packet::ConnAck(_) | Packet::Subscribe(_) | Packet::PingReq => {
                Err(SessionError::UnexpectedPacket("server-bound packet from broker"))
            }
        }
    }

    /// Acknowledge an over-limit PUBLISH so the broker does not redeliver it
    async fn drop_oversized(
        connection: &mut Connection,
        encoder: &Encoder,
        awaiting_rel: &mut HashSet<u16>,
        publish: OversizedPublish,
    ) -> Result<(), SessionError> {
        warn!(
            "Dropping {} byte message on '{}': exceeds inbound packet limit",
            publish.payload_len, publish.topic
        );
        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(id)) => connection.send(encoder, &Packet::PubAck(id)).await,
            (QoS::ExactlyOnce, Some(id)) => {
                awaiting_rel.insert(id);
                connection.send(encoder, &Packet::PubRec(id)).await
            }
            _ => Ok(()),
        }
    }

    async fn receive(&mut self) -> Result<InboundMessage, SessionError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(SessionError::NotConnected)?;

        loop {
            while let Some(packet) = connection.take_packet(&self.decoder)? {
                if let Some(message) =
                    Self::process_packet(connection, &self.encoder, &mut self.awaiting_rel, packet)
                        .await?
                {
                    return Ok(message);
                }
            }
            connection.wait_for_input(&self.encoder).await?;
        }
    }

    async fn request_subscription(
        &mut self,
        topic: &str,
        qos: QoS,
    ) -> Result<Vec<SubscribeReturnCode>, SessionError> {
        let packet_id = self.next_packet_id();
        let deadline = Instant::now() + self.options.connect_timeout;
        let connection = self
            .connection
            .as_mut()
            .ok_or(SessionError::NotConnected)?;

        let subscribe = Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: topic.to_string(),
                qos,
            }],
        });
        connection.send(&self.encoder, &subscribe).await?;

        loop {
            let packet = timeout_at(deadline, connection.read_packet(&self.decoder))
                .await
                .map_err(|_| SessionError::Timeout)??;

            match packet {
                Inbound::Packet(Packet::SubAck(ack)) if ack.packet_id == packet_id => {
                    return Ok(ack.return_codes)
                }
                other => {
                    if let Some(message) = Self::process_packet(
                        connection,
                        &self.encoder,
                        &mut self.awaiting_rel,
                        other,
                    )
                    .await?
                    {
                        self.pending.push_back(message);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn connect(&mut self) -> Result<(), SessionError> {
        self.connection = None;
        self.open().await
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        match self.request_subscription(topic, qos).await {
            Ok(codes) => match codes.first() {
                Some(SubscribeReturnCode::Granted(granted)) => {
                    info!("Subscribed to '{}' (granted {:?})", topic, granted);
                    Ok(())
                }
                _ => Err(SessionError::SubscriptionRejected(topic.to_string())),
            },
            Err(e) => {
                // Whatever interrupted the exchange left the stream unusable
                self.connection = None;
                Err(e)
            }
        }
    }

    async fn next_message(&mut self) -> Option<InboundMessage> {
        if let Some(message) = self.pending.pop_front() {
            return Some(message);
        }
        if self.connection.is_none() {
            return None;
        }

        match self.receive().await {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Broker connection lost: {}", e);
                self.connection = None;
                None
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    async fn reconnect(&mut self) -> Result<(), SessionError> {
        self.connection = None;
        self.open().await
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        if let Some(mut connection) = self.connection.take() {
            connection.send(&self.encoder, &Packet::Disconnect).await?;
            connection.stream.shutdown().await?;
            info!("Disconnected from {}", self.options.address);
        }
        Ok(())
    }
}
