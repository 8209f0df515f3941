// Wire protocol for plume: ASCII verbs, CRLF framing, JSON option payloads.
//
// Clients speak CONNECT/PUB/SUB/UNSUB/PING/PONG and receive INFO/MSG/+OK/-ERR.
// Routes extend the grammar with account-scoped RS+/RS-/RMSG. Verbs are
// case-insensitive on the wire; subjects are case-sensitive.
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub mod parser;

pub use parser::Parser;

pub type Result<T> = std::result::Result<T, Error>;

pub const CRLF: &[u8] = b"\r\n";
pub const PING_LINE: &[u8] = b"PING\r\n";
pub const PONG_LINE: &[u8] = b"PONG\r\n";
pub const OK_LINE: &[u8] = b"+OK\r\n";

// Reasons surfaced to peers in `-ERR '<reason>'` lines.
pub const ERR_UNKNOWN_OP: &str = "Unknown Protocol Operation";
pub const ERR_PARSER: &str = "Parser Error";
pub const ERR_CONTROL_LINE: &str = "Maximum Control Line Exceeded";
pub const ERR_MAX_PAYLOAD: &str = "Maximum Payload Violation";
pub const ERR_INVALID_SUBJECT: &str = "Invalid Subject";
pub const ERR_INVALID_SID: &str = "Invalid Subscription Identifier";
pub const ERR_AUTH: &str = "Authorization Violation";
pub const ERR_SLOW_CONSUMER: &str = "Slow Consumer";
pub const ERR_MAX_SUBS: &str = "Maximum Subscriptions Exceeded";
pub const ERR_MAX_CONNS: &str = "Maximum Connections Exceeded";
pub const ERR_CONNECT_REQUIRED: &str = "Connect Required";
pub const ERR_DUPLICATE_CONNECT: &str = "Duplicate Connect";
pub const ERR_STALE_CONNECTION: &str = "Stale Connection";
pub const ERR_LAME_DUCK: &str = "Server Entering Lame Duck Mode";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("unknown protocol operation: {0}")]
    UnknownOperation(String),
    #[error("malformed control line: {0}")]
    BadControlLine(String),
    #[error("control line exceeds {limit} bytes")]
    ControlLineTooLong { limit: usize },
    #[error("bad payload size: {0}")]
    BadPayloadSize(String),
    #[error("payload of {size} bytes exceeds maximum of {limit}")]
    MaxPayloadExceeded { size: usize, limit: usize },
    #[error("payload not terminated by CRLF at declared length")]
    PayloadFraming,
    #[error("malformed INFO payload: {0}")]
    BadInfo(String),
    #[error("malformed CONNECT payload: {0}")]
    BadConnect(String),
}

impl Error {
    /// The `-ERR` reason a server sends for this parse failure before
    /// closing the connection.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::UnknownOperation(_) => ERR_UNKNOWN_OP,
            Error::ControlLineTooLong { .. } => ERR_CONTROL_LINE,
            Error::MaxPayloadExceeded { .. } => ERR_MAX_PAYLOAD,
            Error::BadConnect(_) | Error::BadInfo(_) => ERR_PARSER,
            Error::BadControlLine(_) | Error::BadPayloadSize(_) | Error::PayloadFraming => {
                ERR_PARSER
            }
        }
    }
}

/// One parsed inbound protocol operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect(ConnectOptions),
    Info(ServerInfo),
    Ping,
    Pong,
    Ok,
    Err(String),
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Bytes,
    },
    Sub {
        subject: String,
        queue: Option<String>,
        sid: String,
    },
    Unsub {
        sid: String,
        max: Option<u64>,
    },
    /// Client-side MSG frame; parsed for harnesses and client tooling.
    Msg {
        subject: String,
        sid: String,
        reply: Option<String>,
        payload: Bytes,
    },
    RouteSub {
        account: String,
        subject: String,
        queue: Option<String>,
        weight: u32,
        rsid: String,
    },
    RouteUnsub {
        account: String,
        subject: String,
        queue: Option<String>,
        rsid: String,
    },
    RouteMsg {
        account: String,
        subject: String,
        reply: Option<String>,
        queues: Vec<String>,
        payload: Bytes,
    },
}

/// `INFO` payload. Sent to clients on connect and on every topology change;
/// exchanged as the first frame in both directions on a route.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub connect_urls: Vec<String>,
    #[serde(default)]
    pub lame_duck_mode: bool,
    /// True while the cluster name is ephemeral and open to negotiation.
    #[serde(default)]
    pub cluster_dynamic: bool,
    /// Advertised route listen address; present in route INFO only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_url: Option<String>,
    /// Route addresses of known peers, for mesh discovery.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub route_urls: Vec<String>,
}

/// `CONNECT` payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ConnectOptions {
    pub verbose: bool,
    pub pedantic: bool,
    pub protocol: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

pub fn encode_info(info: &ServerInfo) -> Bytes {
    let json = serde_json::to_string(info).expect("ServerInfo serializes");
    let mut buf = BytesMut::with_capacity(5 + json.len() + 2);
    buf.extend_from_slice(b"INFO ");
    buf.extend_from_slice(json.as_bytes());
    buf.extend_from_slice(CRLF);
    buf.freeze()
}

pub fn encode_connect(options: &ConnectOptions) -> Bytes {
    let json = serde_json::to_string(options).expect("ConnectOptions serializes");
    let mut buf = BytesMut::with_capacity(8 + json.len() + 2);
    buf.extend_from_slice(b"CONNECT ");
    buf.extend_from_slice(json.as_bytes());
    buf.extend_from_slice(CRLF);
    buf.freeze()
}

pub fn encode_msg(subject: &str, sid: &str, reply: Option<&str>, payload: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(subject.len() + sid.len() + payload.len() + 32);
    buf.extend_from_slice(b"MSG ");
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(sid.as_bytes());
    if let Some(reply) = reply {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(reply.as_bytes());
    }
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
    buf.freeze()
}

pub fn encode_pub(subject: &str, reply: Option<&str>, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(subject.len() + payload.len() + 24);
    buf.extend_from_slice(b"PUB ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(reply) = reply {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(reply.as_bytes());
    }
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
    buf.freeze()
}

/// Route message frame. Reply and queue list are marked explicitly (`+` and
/// `|`) because token counting cannot tell a reply from a lone queue name.
pub fn encode_rmsg(
    account: &str,
    subject: &str,
    reply: Option<&str>,
    queues: &[String],
    payload: &Bytes,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(account.len() + subject.len() + payload.len() + 48);
    buf.extend_from_slice(b"RMSG ");
    buf.extend_from_slice(account.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(reply) = reply {
        buf.extend_from_slice(b" + ");
        buf.extend_from_slice(reply.as_bytes());
    }
    if !queues.is_empty() {
        buf.extend_from_slice(b" |");
        for queue in queues {
            buf.extend_from_slice(b" ");
            buf.extend_from_slice(queue.as_bytes());
        }
    }
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
    buf.freeze()
}

/// Remote interest add. `weight` is carried for queue subs only and reports
/// the sender's local cardinality of the group.
pub fn encode_rs_plus(
    account: &str,
    subject: &str,
    queue: Option<&str>,
    weight: u32,
    rsid: &str,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(account.len() + subject.len() + rsid.len() + 32);
    buf.extend_from_slice(b"RS+ ");
    buf.extend_from_slice(account.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(queue) = queue {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(queue.as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(weight.to_string().as_bytes());
    }
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(rsid.as_bytes());
    buf.extend_from_slice(CRLF);
    buf.freeze()
}

pub fn encode_rs_minus(account: &str, subject: &str, queue: Option<&str>, rsid: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(account.len() + subject.len() + rsid.len() + 24);
    buf.extend_from_slice(b"RS- ");
    buf.extend_from_slice(account.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(queue) = queue {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(queue.as_bytes());
    }
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(rsid.as_bytes());
    buf.extend_from_slice(CRLF);
    buf.freeze()
}

pub fn encode_err(reason: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(reason.len() + 10);
    buf.extend_from_slice(b"-ERR '");
    buf.extend_from_slice(reason.as_bytes());
    buf.extend_from_slice(b"'");
    buf.extend_from_slice(CRLF);
    buf.freeze()
}
