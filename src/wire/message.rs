// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::wire::error::ErrorCode;

/// Metadata attached to `Open`/`OpenAck`/`Close`: a flat string map, cloned by
/// the runtime before it is attached to a context or message (§5, "Metadata
/// maps").
pub type Metadata = HashMap<String, String>;

/// The four call patterns a session can carry (§3, §4.1).
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum RpcType {
    /// One request, one response, repeatable within a session.
    Synchronous,
    /// Interleaved streaming both ways.
    BiDirectional,
    /// Client-to-server stream, single terminal response.
    Send,
    /// Server-to-client stream.
    Recv,
}

/// `pkg/service/method` plus the RPC pattern it is bound to.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub pkg: String,
    pub service: String,
    pub method: String,
    pub rpc_type: RpcType,
}

impl Descriptor {
    pub fn new(pkg: impl Into<String>, service: impl Into<String>, method: impl Into<String>, rpc_type: RpcType) -> Self {
        Self {
            pkg: pkg.into(),
            service: service.into(),
            method: method.into(),
            rpc_type,
        }
    }

    /// `pkg/service/method`, the form used in metadata and credentials (§6).
    pub fn uri(&self) -> String {
        format!("{}/{}/{}", self.pkg, self.service, self.method)
    }
}

/// Numeric compression tag carried on every `Payload` (§6).
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionTag {
    #[default]
    None = 0,
    Gzip = 1,
    Snappy = 2,
    Zstd = 3,
}

impl CompressionTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::Gzip,
            2 => Self::Snappy,
            3 => Self::Zstd,
            _ => return None,
        })
    }
}

/// Client → server: start a session (§4.1).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Open {
    pub open_id: u32,
    pub descriptor: Descriptor,
    pub protocol_major: u16,
    pub protocol_minor: u16,
    pub max_payload_size: u32,
    pub packing_requested: bool,
    pub deadline_ms: Option<u64>,
    pub metadata: Vec<(String, String)>,
}

/// Server → client: accept or reject an `Open` (§4.1).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OpenAck {
    pub open_id: u32,
    pub session_id: u32,
    pub protocol_major: u16,
    pub protocol_minor: u16,
    pub err_code: ErrorCode,
    pub err_message: String,
    pub packing_agreed: bool,
    pub metadata: Vec<(String, String)>,
}

impl OpenAck {
    #[inline]
    pub fn is_rejected(&self) -> bool {
        !self.err_code.is_ok() || self.session_id == 0
    }
}

/// Opaque user bytes carried by a session (§4.1).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Payload {
    pub session_id: u32,
    pub req_id: u32,
    pub bytes: Vec<u8>,
    pub end_stream: bool,
    pub compression: CompressionTag,
}

/// Terminates a session, from either side (§4.1).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Close {
    pub session_id: u32,
    pub err_code: ErrorCode,
    pub err_message: String,
    pub metadata: Vec<(String, String)>,
}

impl Close {
    pub fn ok(session_id: u32) -> Self {
        Self {
            session_id,
            err_code: ErrorCode::None,
            err_message: String::new(),
            metadata: Vec::new(),
        }
    }
}

/// Requests the server stop processing a specific in-flight request; does not
/// imply `Close` (§4.1).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Cancel {
    pub session_id: u32,
    pub req_id: u32,
}

/// Keepalive round trip (§4.1, §4.3).
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct Ping {
    pub id: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct Pong {
    pub id: u64,
}

/// Server-initiated drain signal (§4.1, §4.10).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GoAway {
    pub last_session_id: u32,
    pub err_code: ErrorCode,
    pub debug_data: String,
}

/// The logical-message envelope that every exchange on the transport is a
/// sequence of. Marshaling this to/from bytes is `wire::codec`'s job; framing
/// (recovering the exact boundary between consecutive messages) is a
/// byte-count prefix, not anything this enum concerns itself with.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub enum Message {
    Open(Open),
    OpenAck(OpenAck),
    Payload(Payload),
    Close(Close),
    Cancel(Cancel),
    Ping(Ping),
    Pong(Pong),
    GoAway(GoAway),
}

impl Message {
    /// Open and OpenAck never carry a packing header even when packing is
    /// negotiated (§4.1) — negotiation must be self-bootstrapping.
    #[inline]
    pub fn is_negotiation(&self) -> bool {
        matches!(self, Message::Open(_) | Message::OpenAck(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Open(_) => "Open",
            Message::OpenAck(_) => "OpenAck",
            Message::Payload(_) => "Payload",
            Message::Close(_) => "Close",
            Message::Cancel(_) => "Cancel",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::GoAway(_) => "GoAway",
        }
    }
}
