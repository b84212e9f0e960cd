// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT 3.1.1 client over TCP.

use super::codec::{self, Connect, Packet, SUBACK_FAILURE};
use super::{BrokerConnector, BrokerError, BrokerSession, Incoming};
use crate::config::BrokerConfig;
use crate::message::RawMessage;
use crate::topic::TopicFilter;
use crate::BoxFuture;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Opens MQTT sessions to the configured broker.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: BrokerConfig,
}

impl MqttConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    async fn open(&self) -> Result<MqttSession, BrokerError> {
        if self.config.host.trim().is_empty() {
            return Err(BrokerError::InvalidAddress(self.address()));
        }
        let addr = self.address();
        let timeout = self.config.connect_timeout();

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| BrokerError::Timeout("TCP connect"))??;
        stream.set_nodelay(true)?;

        let mut session = MqttSession::new(stream, &self.config);
        session
            .write_packet(&Packet::Connect(Connect {
                client_id: self.config.client_id.clone(),
                keep_alive: self.config.keep_alive_secs,
                clean_session: self.config.clean_session,
                username: self.config.username.clone(),
                password: self
                    .config
                    .password
                    .as_ref()
                    .map(|p| Bytes::copy_from_slice(p.as_bytes())),
            }))
            .await?;

        let reply = tokio::time::timeout(timeout, session.read_packet())
            .await
            .map_err(|_| BrokerError::Timeout("CONNACK"))??;
        match reply {
            Packet::ConnAck { code: 0, session_present } => {
                debug!(%addr, session_present, "MQTT session established");
                Ok(session)
            }
            Packet::ConnAck { code, .. } => Err(BrokerError::Refused {
                code,
                reason: codec::connack_reason(code),
            }),
            other => Err(BrokerError::Protocol(format!(
                "expected CONNACK, got {}",
                other.name()
            ))),
        }
    }
}

impl BrokerConnector for MqttConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn BrokerSession>, BrokerError>> {
        Box::pin(async move {
            let session = self.open().await?;
            Ok(Box::new(session) as Box<dyn BrokerSession>)
        })
    }
}

/// A connected MQTT session.
pub struct MqttSession {
    stream: TcpStream,
    read_buf: BytesMut,
    max_packet_size: usize,
    keep_alive: Duration,
    ack_timeout: Duration,
    last_sent: Instant,
    ping_sent: Option<Instant>,
    next_packet_id: u16,
    /// Publishes that arrived while waiting for another reply.
    pending: VecDeque<Incoming>,
}

impl MqttSession {
    fn new(stream: TcpStream, config: &BrokerConfig) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            max_packet_size: config.max_packet_size,
            keep_alive: config.keep_alive(),
            ack_timeout: config.connect_timeout(),
            last_sent: Instant::now(),
            ping_sent: None,
            next_packet_id: 0,
            pending: VecDeque::new(),
        }
    }

    fn packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), BrokerError> {
        let mut out = BytesMut::new();
        codec::encode(packet, &mut out);
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        self.last_sent = Instant::now();
        trace!(packet = packet.name(), "sent");
        Ok(())
    }

    /// Read one packet. Cancel-safe: partial frames stay in the buffer.
    async fn read_packet(&mut self) -> Result<Packet, BrokerError> {
        loop {
            if let Some(packet) = codec::decode(&mut self.read_buf, self.max_packet_size)? {
                trace!(packet = packet.name(), "received");
                return Ok(packet);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(BrokerError::Closed);
            }
        }
    }

    fn deliver(publish: codec::Publish) -> Incoming {
        if publish.qos > 1 {
            warn!(topic = %publish.topic, "QoS 2 delivery handled as QoS 1");
        }
        Incoming {
            packet_id: publish.packet_id,
            message: RawMessage::new(publish.topic, publish.payload),
        }
    }

    /// Next keep-alive event, if pings are enabled.
    fn ping_deadline(&self) -> Option<Instant> {
        if self.keep_alive.is_zero() {
            return None;
        }
        Some(match self.ping_sent {
            Some(sent) => sent + self.keep_alive,
            None => self.last_sent + self.keep_alive,
        })
    }

    async fn receive(&mut self) -> Result<Incoming, BrokerError> {
        if let Some(incoming) = self.pending.pop_front() {
            return Ok(incoming);
        }

        loop {
            let deadline = self.ping_deadline();
            let timer = tokio::time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)));

            tokio::select! {
                packet = self.read_packet() => match packet? {
                    Packet::Publish(publish) => return Ok(Self::deliver(publish)),
                    Packet::PingResp => self.ping_sent = None,
                    Packet::Disconnect => return Err(BrokerError::Closed),
                    other => debug!(packet = other.name(), "ignoring unexpected packet"),
                },
                _ = timer, if deadline.is_some() => {
                    if self.ping_sent.is_some() {
                        return Err(BrokerError::KeepAliveTimeout);
                    }
                    self.write_packet(&Packet::PingReq).await?;
                    self.ping_sent = Some(Instant::now());
                }
            }
        }
    }

    async fn subscribe_all(&mut self, filters: &[TopicFilter], qos: u8) -> Result<(), BrokerError> {
        if filters.is_empty() {
            return Ok(());
        }
        let packet_id = self.packet_id();
        let requested: Vec<(String, u8)> = filters
            .iter()
            .map(|f| (f.as_str().to_string(), qos))
            .collect();
        self.write_packet(&Packet::Subscribe {
            packet_id,
            filters: requested,
        })
        .await?;

        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let packet = tokio::time::timeout_at(deadline, self.read_packet())
                .await
                .map_err(|_| BrokerError::Timeout("SUBACK"))??;
            match packet {
                Packet::SubAck {
                    packet_id: id,
                    return_codes,
                } if id == packet_id => {
                    if return_codes.len() != filters.len() {
                        return Err(BrokerError::Protocol(format!(
                            "SUBACK has {} return codes for {} filters",
                            return_codes.len(),
                            filters.len()
                        )));
                    }
                    for (filter, code) in filters.iter().zip(&return_codes) {
                        if *code == SUBACK_FAILURE {
                            return Err(BrokerError::SubscribeRefused(filter.to_string()));
                        }
                        if *code < qos {
                            warn!(filter = %filter, granted = code, requested = qos, "broker downgraded QoS");
                        }
                    }
                    return Ok(());
                }
                // Retained messages may arrive before the SUBACK.
                Packet::Publish(publish) => self.pending.push_back(Self::deliver(publish)),
                Packet::PingResp => self.ping_sent = None,
                Packet::Disconnect => return Err(BrokerError::Closed),
                other => debug!(packet = other.name(), "ignoring packet while subscribing"),
            }
        }
    }
}

impl BrokerSession for MqttSession {
    fn subscribe<'a>(
        &'a mut self,
        filters: &'a [TopicFilter],
        qos: u8,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(self.subscribe_all(filters, qos))
    }

    fn next_message(&mut self) -> BoxFuture<'_, Result<Incoming, BrokerError>> {
        Box::pin(self.receive())
    }

    fn ack(&mut self, packet_id: u16) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move { self.write_packet(&Packet::PubAck { packet_id }).await })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.write_packet(&Packet::Disconnect).await?;
            self.stream.shutdown().await?;
            Ok(())
        })
    }
}
