//! # Wire codec: BSON request/event envelopes
//!
//! Every client message is one BSON document:
//!
//! ```text
//! request  { method: "sendto", args: [id, <4-byte addr>, port, <data>] }
//! event    { m: "recv",        a:    [id, <data>] }
//! ```
//!
//! Requests also accept the short `m` / `a` keys. Requests are validated
//! into the closed `Request` enum here, so the session dispatcher is a plain
//! `match` and never sees an unknown method or a mis-typed argument.
//! Byte payloads and addresses travel as BSON binary (generic subtype).

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};

use crate::error::WireError;
use crate::types::SocketId;

/// Methods a client may invoke.
pub const METHODS: [&str; 6] = ["socket", "socket_close", "bind", "connect", "send", "sendto"];

/// A validated client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `socket(socket_id, kind)`. The kind is kept raw so the session can
    /// reject it with `UnsupportedKind`.
    Socket { socket_id: SocketId, kind: i64 },
    SocketClose { socket_id: SocketId },
    Bind { socket_id: SocketId, port: u16 },
    /// `address` is kept raw: it is ignored for port 53 and only parsed
    /// as IPv4 by the socket otherwise.
    Connect { socket_id: SocketId, address: Vec<u8>, port: u16 },
    Send { socket_id: SocketId, data: Vec<u8> },
    SendTo { socket_id: SocketId, address: Vec<u8>, port: u16, data: Vec<u8> },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Socket { .. } => "socket",
            Request::SocketClose { .. } => "socket_close",
            Request::Bind { .. } => "bind",
            Request::Connect { .. } => "connect",
            Request::Send { .. } => "send",
            Request::SendTo { .. } => "sendto",
        }
    }

    pub fn socket_id(&self) -> SocketId {
        match self {
            Request::Socket { socket_id, .. }
            | Request::SocketClose { socket_id }
            | Request::Bind { socket_id, .. }
            | Request::Connect { socket_id, .. }
            | Request::Send { socket_id, .. }
            | Request::SendTo { socket_id, .. } => *socket_id,
        }
    }

    /// Decode and validate one request document.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let doc = read_document(bytes)?;

        let method = match doc.get("method").or_else(|| doc.get("m")) {
            None => return Err(WireError::MissingField("method")),
            Some(Bson::String(s)) => s.as_str(),
            Some(_) => {
                return Err(WireError::WrongType {
                    field: "method",
                    expected: "a string",
                })
            }
        };
        let items = match doc.get("args").or_else(|| doc.get("a")) {
            None => return Err(WireError::MissingField("args")),
            Some(Bson::Array(items)) => items.as_slice(),
            Some(_) => {
                return Err(WireError::WrongType {
                    field: "args",
                    expected: "a list",
                })
            }
        };

        let name = METHODS
            .iter()
            .copied()
            .find(|m| *m == method)
            .ok_or_else(|| WireError::UnknownMethod(method.to_string()))?;
        let args = Args { method: name, items };

        let request = match name {
            "socket" => {
                args.arity(2)?;
                Request::Socket {
                    socket_id: args.int(0)?,
                    kind: args.int(1)?,
                }
            }
            "socket_close" => {
                args.arity(1)?;
                Request::SocketClose { socket_id: args.int(0)? }
            }
            "bind" => {
                args.arity(2)?;
                Request::Bind {
                    socket_id: args.int(0)?,
                    port: args.port(1)?,
                }
            }
            "connect" => {
                args.arity(3)?;
                Request::Connect {
                    socket_id: args.int(0)?,
                    address: args.bytes(1)?,
                    port: args.port(2)?,
                }
            }
            "send" => {
                args.arity(2)?;
                Request::Send {
                    socket_id: args.int(0)?,
                    data: args.bytes(1)?,
                }
            }
            _ => {
                args.arity(4)?;
                Request::SendTo {
                    socket_id: args.int(0)?,
                    address: args.bytes(1)?,
                    port: args.port(2)?,
                    data: args.bytes(3)?,
                }
            }
        };
        Ok(request)
    }

    /// Encode as a request document (`method` / `args`). Used by clients
    /// and tests; the relay itself only decodes requests.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let args = match self {
            Request::Socket { socket_id, kind } => vec![int(*socket_id), int(*kind)],
            Request::SocketClose { socket_id } => vec![int(*socket_id)],
            Request::Bind { socket_id, port } => vec![int(*socket_id), int(i64::from(*port))],
            Request::Connect { socket_id, address, port } => {
                vec![int(*socket_id), binary(address), int(i64::from(*port))]
            }
            Request::Send { socket_id, data } => vec![int(*socket_id), binary(data)],
            Request::SendTo { socket_id, address, port, data } => vec![
                int(*socket_id),
                binary(address),
                int(i64::from(*port)),
                binary(data),
            ],
        };
        let mut doc = Document::new();
        doc.insert("method", self.method());
        doc.insert("args", Bson::Array(args));
        write_document(&doc)
    }
}

/// An event pushed to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Recv { socket_id: SocketId, data: Vec<u8> },
    Closed { socket_id: SocketId },
    Connected { socket_id: SocketId, success: bool },
}

impl Event {
    pub fn method(&self) -> &'static str {
        match self {
            Event::Recv { .. } => "recv",
            Event::Closed { .. } => "closed",
            Event::Connected { .. } => "connected",
        }
    }

    pub fn socket_id(&self) -> SocketId {
        match self {
            Event::Recv { socket_id, .. }
            | Event::Closed { socket_id }
            | Event::Connected { socket_id, .. } => *socket_id,
        }
    }

    /// Encode as `{ m: <method>, a: [...] }`.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let args = match self {
            Event::Recv { socket_id, data } => vec![int(*socket_id), binary(data)],
            Event::Closed { socket_id } => vec![int(*socket_id)],
            Event::Connected { socket_id, success } => {
                vec![int(*socket_id), int(i64::from(*success))]
            }
        };
        let mut doc = Document::new();
        doc.insert("m", self.method());
        doc.insert("a", Bson::Array(args));
        write_document(&doc)
    }

    /// Decode an event document (client side of the protocol).
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let doc = read_document(bytes)?;
        let method = match doc.get("m") {
            Some(Bson::String(s)) => s.as_str(),
            Some(_) => {
                return Err(WireError::WrongType {
                    field: "m",
                    expected: "a string",
                })
            }
            None => return Err(WireError::MissingField("m")),
        };
        let items = match doc.get("a") {
            Some(Bson::Array(items)) => items.as_slice(),
            Some(_) => {
                return Err(WireError::WrongType {
                    field: "a",
                    expected: "a list",
                })
            }
            None => return Err(WireError::MissingField("a")),
        };
        match method {
            "recv" => {
                let args = Args { method: "recv", items };
                args.arity(2)?;
                Ok(Event::Recv {
                    socket_id: args.int(0)?,
                    data: args.bytes(1)?,
                })
            }
            "closed" => {
                let args = Args { method: "closed", items };
                args.arity(1)?;
                Ok(Event::Closed { socket_id: args.int(0)? })
            }
            "connected" => {
                let args = Args { method: "connected", items };
                args.arity(2)?;
                Ok(Event::Connected {
                    socket_id: args.int(0)?,
                    success: args.int(1)? != 0,
                })
            }
            other => Err(WireError::UnknownMethod(other.to_string())),
        }
    }
}

/// Positional argument accessor for one method.
struct Args<'a> {
    method: &'static str,
    items: &'a [Bson],
}

impl Args<'_> {
    fn bad(&self, reason: String) -> WireError {
        WireError::BadArguments {
            method: self.method,
            reason,
        }
    }

    fn arity(&self, n: usize) -> Result<(), WireError> {
        if self.items.len() != n {
            return Err(self.bad(format!("expected {} arguments, got {}", n, self.items.len())));
        }
        Ok(())
    }

    fn int(&self, i: usize) -> Result<i64, WireError> {
        match &self.items[i] {
            Bson::Int32(v) => Ok(i64::from(*v)),
            Bson::Int64(v) => Ok(*v),
            Bson::Double(v)
                if v.is_finite()
                    && v.fract() == 0.0
                    && *v >= i64::MIN as f64
                    && *v <= i64::MAX as f64 =>
            {
                Ok(*v as i64)
            }
            other => Err(self.bad(format!("argument {} must be an integer, got {:?}", i, other.element_type()))),
        }
    }

    fn port(&self, i: usize) -> Result<u16, WireError> {
        let v = self.int(i)?;
        u16::try_from(v).map_err(|_| self.bad(format!("argument {} is not a port: {}", i, v)))
    }

    fn bytes(&self, i: usize) -> Result<Vec<u8>, WireError> {
        match &self.items[i] {
            Bson::Binary(b) => Ok(b.bytes.clone()),
            other => Err(self.bad(format!("argument {} must be binary, got {:?}", i, other.element_type()))),
        }
    }
}

fn int(v: i64) -> Bson {
    match i32::try_from(v) {
        Ok(small) => Bson::Int32(small),
        Err(_) => Bson::Int64(v),
    }
}

fn binary(bytes: &[u8]) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    })
}

fn read_document(bytes: &[u8]) -> Result<Document, WireError> {
    let mut reader = bytes;
    Document::from_reader(&mut reader).map_err(|e| WireError::Malformed(e.to_string()))
}

fn write_document(doc: &Document) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(64);
    doc.to_writer(&mut buf)
        .map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buf)
}
