// Incremental protocol parser.
//
// Bytes arrive in arbitrary read-sized chunks; the parser buffers across
// boundaries and emits complete commands. Payload-bearing verbs (PUB, MSG,
// RMSG) parse in two steps: control line first, then the declared number of
// payload bytes which must be followed by CRLF.
use bytes::{Bytes, BytesMut};

use crate::{Command, ConnectOptions, Error, Result, ServerInfo};

pub const DEFAULT_MAX_CONTROL_LINE: usize = 4096;
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

#[derive(Debug)]
pub struct Parser {
    buf: BytesMut,
    pending: Option<Pending>,
    max_control_line: usize,
    max_payload: usize,
}

#[derive(Debug)]
struct Pending {
    header: PendingHeader,
    size: usize,
}

#[derive(Debug)]
enum PendingHeader {
    Pub {
        subject: String,
        reply: Option<String>,
    },
    Msg {
        subject: String,
        sid: String,
        reply: Option<String>,
    },
    RouteMsg {
        account: String,
        subject: String,
        reply: Option<String>,
        queues: Vec<String>,
    },
}

impl Pending {
    fn complete(self, payload: Bytes) -> Command {
        match self.header {
            PendingHeader::Pub { subject, reply } => Command::Pub {
                subject,
                reply,
                payload,
            },
            PendingHeader::Msg {
                subject,
                sid,
                reply,
            } => Command::Msg {
                subject,
                sid,
                reply,
                payload,
            },
            PendingHeader::RouteMsg {
                account,
                subject,
                reply,
                queues,
            } => Command::RouteMsg {
                account,
                subject,
                reply,
                queues,
                payload,
            },
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTROL_LINE, DEFAULT_MAX_PAYLOAD)
    }
}

impl Parser {
    pub fn new(max_control_line: usize, max_payload: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            pending: None,
            max_control_line,
            max_payload,
        }
    }

    /// Consume one read chunk, returning every command it completed. A parse
    /// error is fatal for the connection; the parser must not be fed again.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Command>> {
        self.buf.extend_from_slice(chunk);
        let mut commands = Vec::new();
        loop {
            if let Some(pending) = self.pending.take() {
                // Need payload plus the trailing CRLF before continuing.
                if self.buf.len() < pending.size + 2 {
                    self.pending = Some(pending);
                    break;
                }
                if &self.buf[pending.size..pending.size + 2] != b"\r\n" {
                    return Err(Error::PayloadFraming);
                }
                let payload = self.buf.split_to(pending.size).freeze();
                let _ = self.buf.split_to(2);
                commands.push(pending.complete(payload));
                continue;
            }

            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > self.max_control_line {
                    return Err(Error::ControlLineTooLong {
                        limit: self.max_control_line,
                    });
                }
                break;
            };
            if pos > self.max_control_line {
                return Err(Error::ControlLineTooLong {
                    limit: self.max_control_line,
                });
            }
            let raw = self.buf.split_to(pos + 1);
            let line = &raw[..pos];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let line = std::str::from_utf8(line)
                .map_err(|_| Error::BadControlLine("non-utf8 control line".into()))?;
            if line.is_empty() {
                continue;
            }
            match self.parse_control(line)? {
                Step::Emit(command) => commands.push(command),
                Step::Await(pending) => self.pending = Some(pending),
            }
        }
        Ok(commands)
    }

    fn parse_control(&self, line: &str) -> Result<Step> {
        let (verb, rest) = match line.find(|c: char| c.is_ascii_whitespace()) {
            Some(idx) => (&line[..idx], line[idx..].trim_start()),
            None => (line, ""),
        };
        match verb.to_ascii_uppercase().as_str() {
            "PING" => Ok(Step::Emit(Command::Ping)),
            "PONG" => Ok(Step::Emit(Command::Pong)),
            "+OK" => Ok(Step::Emit(Command::Ok)),
            "-ERR" => Ok(Step::Emit(Command::Err(
                rest.trim_matches('\'').to_string(),
            ))),
            "CONNECT" => {
                let options: ConnectOptions = serde_json::from_str(rest)
                    .map_err(|err| Error::BadConnect(err.to_string()))?;
                Ok(Step::Emit(Command::Connect(options)))
            }
            "INFO" => {
                let info: ServerInfo =
                    serde_json::from_str(rest).map_err(|err| Error::BadInfo(err.to_string()))?;
                Ok(Step::Emit(Command::Info(info)))
            }
            "SUB" => self.parse_sub(rest),
            "UNSUB" => self.parse_unsub(rest),
            "PUB" => self.parse_pub(rest),
            "MSG" => self.parse_msg(rest),
            "RS+" => self.parse_rs_plus(rest),
            "RS-" => self.parse_rs_minus(rest),
            "RMSG" => self.parse_rmsg(rest),
            other => Err(Error::UnknownOperation(other.to_string())),
        }
    }

    fn parse_sub(&self, rest: &str) -> Result<Step> {
        let args: Vec<&str> = rest.split_ascii_whitespace().collect();
        let (subject, queue, sid) = match args.as_slice() {
            [subject, sid] => (*subject, None, *sid),
            [subject, queue, sid] => (*subject, Some(queue.to_string()), *sid),
            _ => return Err(Error::BadControlLine(format!("SUB {rest}"))),
        };
        Ok(Step::Emit(Command::Sub {
            subject: subject.to_string(),
            queue,
            sid: sid.to_string(),
        }))
    }

    fn parse_unsub(&self, rest: &str) -> Result<Step> {
        let args: Vec<&str> = rest.split_ascii_whitespace().collect();
        let (sid, max) = match args.as_slice() {
            [sid] => (*sid, None),
            [sid, max] => {
                let max = max
                    .parse::<u64>()
                    .map_err(|_| Error::BadControlLine(format!("UNSUB {rest}")))?;
                (*sid, Some(max))
            }
            _ => return Err(Error::BadControlLine(format!("UNSUB {rest}"))),
        };
        Ok(Step::Emit(Command::Unsub {
            sid: sid.to_string(),
            max,
        }))
    }

    fn parse_pub(&self, rest: &str) -> Result<Step> {
        let args: Vec<&str> = rest.split_ascii_whitespace().collect();
        let (subject, reply, size) = match args.as_slice() {
            [subject, size] => (*subject, None, *size),
            [subject, reply, size] => (*subject, Some(reply.to_string()), *size),
            _ => return Err(Error::BadControlLine(format!("PUB {rest}"))),
        };
        let size = self.parse_size(size)?;
        Ok(Step::Await(Pending {
            header: PendingHeader::Pub {
                subject: subject.to_string(),
                reply,
            },
            size,
        }))
    }

    fn parse_msg(&self, rest: &str) -> Result<Step> {
        let args: Vec<&str> = rest.split_ascii_whitespace().collect();
        let (subject, sid, reply, size) = match args.as_slice() {
            [subject, sid, size] => (*subject, *sid, None, *size),
            [subject, sid, reply, size] => (*subject, *sid, Some(reply.to_string()), *size),
            _ => return Err(Error::BadControlLine(format!("MSG {rest}"))),
        };
        let size = self.parse_size(size)?;
        Ok(Step::Await(Pending {
            header: PendingHeader::Msg {
                subject: subject.to_string(),
                sid: sid.to_string(),
                reply,
            },
            size,
        }))
    }

    fn parse_rs_plus(&self, rest: &str) -> Result<Step> {
        let args: Vec<&str> = rest.split_ascii_whitespace().collect();
        // Arity disambiguates: queue subs always carry the weight.
        let (account, subject, queue, weight, rsid) = match args.as_slice() {
            [account, subject, rsid] => (*account, *subject, None, 0, *rsid),
            [account, subject, queue, rsid] => (*account, *subject, Some(queue.to_string()), 1, *rsid),
            [account, subject, queue, weight, rsid] => {
                let weight = weight
                    .parse::<u32>()
                    .map_err(|_| Error::BadControlLine(format!("RS+ {rest}")))?;
                (*account, *subject, Some(queue.to_string()), weight, *rsid)
            }
            _ => return Err(Error::BadControlLine(format!("RS+ {rest}"))),
        };
        Ok(Step::Emit(Command::RouteSub {
            account: account.to_string(),
            subject: subject.to_string(),
            queue,
            weight,
            rsid: rsid.to_string(),
        }))
    }

    fn parse_rs_minus(&self, rest: &str) -> Result<Step> {
        let args: Vec<&str> = rest.split_ascii_whitespace().collect();
        let (account, subject, queue, rsid) = match args.as_slice() {
            [account, subject, rsid] => (*account, *subject, None, *rsid),
            [account, subject, queue, rsid] => (*account, *subject, Some(queue.to_string()), *rsid),
            _ => return Err(Error::BadControlLine(format!("RS- {rest}"))),
        };
        Ok(Step::Emit(Command::RouteUnsub {
            account: account.to_string(),
            subject: subject.to_string(),
            queue,
            rsid: rsid.to_string(),
        }))
    }

    fn parse_rmsg(&self, rest: &str) -> Result<Step> {
        let args: Vec<&str> = rest.split_ascii_whitespace().collect();
        if args.len() < 3 {
            return Err(Error::BadControlLine(format!("RMSG {rest}")));
        }
        let account = args[0].to_string();
        let subject = args[1].to_string();
        let size = self.parse_size(args[args.len() - 1])?;
        let mut middle = &args[2..args.len() - 1];

        let mut reply = None;
        if let [marker, value, rest @ ..] = middle
            && *marker == "+"
        {
            reply = Some(value.to_string());
            middle = rest;
        }
        let queues = match middle.split_first() {
            None => Vec::new(),
            Some((&"|", names)) if !names.is_empty() => {
                names.iter().map(|q| q.to_string()).collect()
            }
            Some(_) => return Err(Error::BadControlLine(format!("RMSG {rest}"))),
        };
        Ok(Step::Await(Pending {
            header: PendingHeader::RouteMsg {
                account,
                subject,
                reply,
                queues,
            },
            size,
        }))
    }

    fn parse_size(&self, token: &str) -> Result<usize> {
        let size = token
            .parse::<usize>()
            .map_err(|_| Error::BadPayloadSize(token.to_string()))?;
        if size > self.max_payload {
            return Err(Error::MaxPayloadExceeded {
                size,
                limit: self.max_payload,
            });
        }
        Ok(size)
    }
}

enum Step {
    Emit(Command),
    Await(Pending),
}
