use rumqttc::QoS;
use std::fmt;
use std::str::FromStr;

use super::codec::Frame;

/// Verbs a host may send to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Publish,
    Subscribe,
    Mem,
    Time,
    Status,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Publish => "PUBLISH",
            Verb::Subscribe => "SUBSCRIBE",
            Verb::Mem => "MEM",
            Verb::Time => "TIME",
            Verb::Status => "STATUS",
        }
    }
}

impl FromStr for Verb {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUBLISH" => Ok(Verb::Publish),
            "SUBSCRIBE" => Ok(Verb::Subscribe),
            "MEM" => Ok(Verb::Mem),
            "TIME" => Ok(Verb::Time),
            "STATUS" => Ok(Verb::Status),
            other => Err(ProtocolError::UnknownVerb(other.to_string())),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown verb: {0}")]
    UnknownVerb(String),

    #[error("{verb} is missing field {field}")]
    MissingField { verb: Verb, field: &'static str },

    #[error("{verb} has invalid {field}: {value}")]
    InvalidField {
        verb: Verb,
        field: &'static str,
        value: String,
    },
}

/// A fully parsed host request
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Publish {
        topic: String,
        payload: String,
        retain: bool,
        qos: QoS,
    },
    Subscribe {
        topic: String,
        qos: QoS,
    },
    Mem,
    Time,
    Status,
}

impl Command {
    /// Parses a raw protocol line into a typed command
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let frame = Frame::decode(raw);
        let verb: Verb = frame.verb.parse()?;

        match verb {
            Verb::Publish => Ok(Command::Publish {
                topic: required(&frame, verb, 0, "topic")?.to_string(),
                payload: required(&frame, verb, 1, "payload")?.to_string(),
                retain: parse_flag(verb, "retain", required(&frame, verb, 2, "retain")?)?,
                qos: parse_qos(verb, required(&frame, verb, 3, "qos")?)?,
            }),
            Verb::Subscribe => Ok(Command::Subscribe {
                topic: required(&frame, verb, 0, "topic")?.to_string(),
                qos: parse_qos(verb, required(&frame, verb, 1, "qos")?)?,
            }),
            Verb::Mem => Ok(Command::Mem),
            Verb::Time => Ok(Command::Time),
            Verb::Status => Ok(Command::Status),
        }
    }

    pub fn verb(&self) -> Verb {
        match self {
            Command::Publish { .. } => Verb::Publish,
            Command::Subscribe { .. } => Verb::Subscribe,
            Command::Mem => Verb::Mem,
            Command::Time => Verb::Time,
            Command::Status => Verb::Status,
        }
    }
}

fn required<'a>(
    frame: &'a Frame,
    verb: Verb,
    index: usize,
    field: &'static str,
) -> Result<&'a str, ProtocolError> {
    match frame.field(index) {
        Some(value) if !value.is_empty() || field == "payload" => Ok(value),
        _ => Err(ProtocolError::MissingField { verb, field }),
    }
}

fn parse_flag(verb: Verb, field: &'static str, value: &str) -> Result<bool, ProtocolError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(ProtocolError::InvalidField {
            verb,
            field,
            value: value.to_string(),
        }),
    }
}

fn parse_qos(verb: Verb, value: &str) -> Result<QoS, ProtocolError> {
    let invalid = || ProtocolError::InvalidField {
        verb,
        field: "qos",
        value: value.to_string(),
    };

    match value.trim().parse::<u8>().map_err(|_| invalid())? {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        _ => Err(invalid()),
    }
}

/// Numeric status values shared with the host-side library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    BrokerOk = 0,
    BrokerCheck = 1,
    BrokerFail = 2,
    WifiUp = 3,
    WifiDown = 4,
    PubOk = 5,
    Running = 6,
    Unknown = 7,
    PubFail = 8,
    SubFail = 9,
}

impl StatusCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn wifi(up: bool) -> Self {
        if up {
            StatusCode::WifiUp
        } else {
            StatusCode::WifiDown
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Messages the gateway sends to hosts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Status(StatusCode),
    /// Reply to a line that could not be executed, echoing it back
    Unknown(String),
    Subscription {
        topic: String,
        payload: String,
        retain: bool,
    },
    Mem {
        free: u64,
        used: u64,
    },
    Time(u64),
}

impl Notice {
    pub fn to_frame(&self) -> Frame {
        match self {
            Notice::Status(code) => Frame::new("STATUS").arg(code),
            Notice::Unknown(raw) => Frame::new("STATUS")
                .arg(StatusCode::Unknown)
                .arg("Unknown command:")
                .arg(raw),
            Notice::Subscription {
                topic,
                payload,
                retain,
            } => Frame::new("SUBSCRIPTION")
                .arg(topic)
                .arg(payload)
                .arg(if *retain { "True" } else { "False" }),
            Notice::Mem { free, used } => Frame::new("MEM").arg(free).arg(used),
            Notice::Time(epoch) => Frame::new("TIME").arg(epoch),
        }
    }

    pub fn encode(&self) -> String {
        self.to_frame().encode()
    }
}
