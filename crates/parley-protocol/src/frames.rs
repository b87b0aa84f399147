//! Frame types for the Parley wire protocol.
//!
//! The wire protocol is the subset of MQTT 3.1.1 a chat client needs:
//! connect/acknowledge, subscribe/unsubscribe, publish, keep-alive ping
//! and clean disconnect.

use bytes::Bytes;

/// Packet type identifiers (high nibble of the fixed header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnectAck = 2,
    Publish = 3,
    PublishAck = 4,
    Subscribe = 8,
    SubscribeAck = 9,
    Unsubscribe = 10,
    UnsubscribeAck = 11,
    PingRequest = 12,
    PingResponse = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Name used in logs and error messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            PacketType::Connect => "CONNECT",
            PacketType::ConnectAck => "CONNACK",
            PacketType::Publish => "PUBLISH",
            PacketType::PublishAck => "PUBACK",
            PacketType::Subscribe => "SUBSCRIBE",
            PacketType::SubscribeAck => "SUBACK",
            PacketType::Unsubscribe => "UNSUBSCRIBE",
            PacketType::UnsubscribeAck => "UNSUBACK",
            PacketType::PingRequest => "PINGREQ",
            PacketType::PingResponse => "PINGRESP",
            PacketType::Disconnect => "DISCONNECT",
        }
    }
}

impl From<PacketType> for u8 {
    fn from(pt: PacketType) -> u8 {
        pt as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnectAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PublishAck),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubscribeAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubscribeAck),
            12 => Ok(PacketType::PingRequest),
            13 => Ok(PacketType::PingResponse),
            14 => Ok(PacketType::Disconnect),
            other => Err(other),
        }
    }
}

/// Quality of service level for publish and subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    /// Fire and forget.
    #[default]
    AtMostOnce = 0,
    /// Acknowledged delivery.
    AtLeastOnce = 1,
    /// Assured delivery (encoded only; the client does not run the QoS 2 flow).
    ExactlyOnce = 2,
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        qos as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(other),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Session handshake sent by the client.
    Connect {
        /// Client identifier, unique per broker.
        client_id: String,
        /// Optional user name.
        username: Option<String>,
        /// Optional password (an access token for chat brokers).
        password: Option<String>,
        /// Keep-alive interval the broker should expect, in seconds.
        keep_alive_secs: u16,
        /// Ask the broker to discard prior session state.
        clean_session: bool,
    },

    /// Handshake reply from the broker.
    ConnectAck {
        /// Broker kept a session for this client id.
        session_present: bool,
        /// 0 means accepted; anything else is a refusal code.
        return_code: u8,
    },

    /// Application payload addressed to a topic.
    Publish {
        /// Target topic.
        topic: String,
        /// Present iff `qos` is above `AtMostOnce`.
        message_id: Option<u16>,
        /// Raw payload, runs to the end of the frame.
        payload: Bytes,
        /// Delivery guarantee.
        qos: QoS,
        /// Broker should retain the last value.
        retain: bool,
        /// Redelivery flag.
        dup: bool,
    },

    /// Acknowledges a QoS 1 publish.
    PublishAck {
        /// Id of the acknowledged publish.
        message_id: u16,
    },

    /// Subscribe to a single topic.
    Subscribe {
        /// Id echoed back in the SubscribeAck.
        message_id: u16,
        /// Topic filter.
        topic: String,
        /// Requested maximum QoS.
        qos: QoS,
    },

    /// Broker reply to a subscribe.
    SubscribeAck {
        /// Id of the acknowledged subscribe.
        message_id: u16,
        /// Granted QoS per topic, `0x80` on failure.
        return_codes: Vec<u8>,
    },

    /// Drop a single topic subscription.
    Unsubscribe {
        /// Id echoed back in the UnsubscribeAck.
        message_id: u16,
        /// Topic filter.
        topic: String,
    },

    /// Broker reply to an unsubscribe.
    UnsubscribeAck {
        /// Id of the acknowledged unsubscribe.
        message_id: u16,
    },

    /// Keep-alive probe.
    PingRequest,

    /// Keep-alive answer.
    PingResponse,

    /// Graceful end of session.
    Disconnect,
}

impl Frame {
    /// Get the packet type.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Frame::Connect { .. } => PacketType::Connect,
            Frame::ConnectAck { .. } => PacketType::ConnectAck,
            Frame::Publish { .. } => PacketType::Publish,
            Frame::PublishAck { .. } => PacketType::PublishAck,
            Frame::Subscribe { .. } => PacketType::Subscribe,
            Frame::SubscribeAck { .. } => PacketType::SubscribeAck,
            Frame::Unsubscribe { .. } => PacketType::Unsubscribe,
            Frame::UnsubscribeAck { .. } => PacketType::UnsubscribeAck,
            Frame::PingRequest => PacketType::PingRequest,
            Frame::PingResponse => PacketType::PingResponse,
            Frame::Disconnect => PacketType::Disconnect,
        }
    }

    /// Create a Connect frame with a clean session and no credentials.
    #[must_use]
    pub fn connect(client_id: impl Into<String>, keep_alive_secs: u16) -> Self {
        Frame::Connect {
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive_secs,
            clean_session: true,
        }
    }

    /// Create an accepting ConnectAck frame.
    #[must_use]
    pub fn connect_ack() -> Self {
        Frame::ConnectAck {
            session_present: false,
            return_code: 0,
        }
    }

    /// Create a QoS 0 Publish frame.
    #[must_use]
    pub fn publish(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Frame::Publish {
            topic: topic.into(),
            message_id: None,
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
        }
    }

    /// Create a Subscribe frame.
    #[must_use]
    pub fn subscribe(message_id: u16, topic: impl Into<String>, qos: QoS) -> Self {
        Frame::Subscribe {
            message_id,
            topic: topic.into(),
            qos,
        }
    }

    /// Create an Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(message_id: u16, topic: impl Into<String>) -> Self {
        Frame::Unsubscribe {
            message_id,
            topic: topic.into(),
        }
    }
}
