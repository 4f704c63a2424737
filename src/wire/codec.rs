// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Marshals `Message`s to/from a length-delimited byte stream (§4.1: "each
//! marshalled message is length-delimited such that an ordered reader can
//! recover the exact boundary between consecutive messages").
//!
//! Frame layout on the wire: `[u32 BE total_len][u8 packed_flag][body]`.
//! `body` is either a bincode-marshaled `Message` (`packed_flag == 0`) or a
//! 16-byte pack header followed by the packed body (`packed_flag == 1`,
//! §4.1 "Packing"). The binary record format for *user* payload bytes inside
//! a `Payload` message stays opaque to this codec — it only ever sees the
//! envelope, never the application bytes it carries.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{
    message::Message,
    pack::{self, PACK_HEADER_LEN},
};

const LEN_PREFIX: usize = 4;
const FLAG_UNPACKED: u8 = 0;
const FLAG_PACKED: u8 = 1;

/// Hard ceiling on a single frame so a corrupt or hostile peer cannot make us
/// allocate unboundedly while reading the length prefix.
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

pub fn marshal(msg: &Message) -> Result<Vec<u8>> {
    bincode::serialize(msg).context("marshal message")
}

pub fn unmarshal(bytes: &[u8]) -> Result<Message> {
    bincode::deserialize(bytes).context("unmarshal message")
}

/// Writes one logical message. `pack_active` is `true` only when packing was
/// negotiated *and* the message is not `Open`/`OpenAck` (the caller is
/// expected to have already applied that exclusion — see
/// `ClientConnection::write`/`ServerConnection::write`).
pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message, pack_active: bool) -> Result<()> {
    let body = marshal(msg)?;

    let (flag, wire_body) = if pack_active && !msg.is_negotiation() {
        let packed = pack::pack(&body);
        let hdr = pack::encode_header(body.len() as u64, packed.len() as u64);
        let mut framed = Vec::with_capacity(PACK_HEADER_LEN + packed.len());
        framed.extend_from_slice(&hdr);
        framed.extend_from_slice(&packed);
        (FLAG_PACKED, framed)
    } else {
        (FLAG_UNPACKED, body)
    };

    let total_len = 1 + wire_body.len();
    if total_len as u64 > MAX_FRAME_LEN as u64 {
        bail!("outgoing frame of {total_len} bytes exceeds {MAX_FRAME_LEN}");
    }

    let mut out = Vec::with_capacity(LEN_PREFIX + total_len);
    out.extend_from_slice(&(total_len as u32).to_be_bytes());
    out.push(flag);
    out.extend_from_slice(&wire_body);

    w.write_all(&out).await.context("write frame")?;
    w.flush().await.context("flush frame")?;
    Ok(())
}

/// Reads exactly one logical message, or `Ok(None)` on a clean EOF between
/// frames (the only EOF that is not an error: mid-frame EOF propagates as an
/// `io::Error`, which callers treat as fatal per §4.3/§7).
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Message>> {
    let mut len_buf = [0u8; LEN_PREFIX];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("read frame length"),
    }
    let total_len = u32::from_be_bytes(len_buf);
    if total_len > MAX_FRAME_LEN {
        bail!("incoming frame of {total_len} bytes exceeds {MAX_FRAME_LEN}");
    }
    if total_len == 0 {
        bail!("incoming frame has zero length (missing packed-flag byte)");
    }

    let mut body = vec![0u8; total_len as usize];
    r.read_exact(&mut body).await.context("read frame body")?;

    let flag = body[0];
    let rest = &body[1..];

    let msg_bytes = match flag {
        FLAG_UNPACKED => rest.to_vec(),
        FLAG_PACKED => {
            if rest.len() < PACK_HEADER_LEN {
                bail!("packed frame shorter than pack header");
            }
            let mut hdr = [0u8; PACK_HEADER_LEN];
            hdr.copy_from_slice(&rest[..PACK_HEADER_LEN]);
            let (unpacked_size, packed_size) = pack::decode_header(&hdr);
            let packed_body = &rest[PACK_HEADER_LEN..];
            if packed_body.len() as u64 != packed_size {
                bail!(
                    "pack header declares {packed_size} packed bytes, frame carries {}",
                    packed_body.len()
                );
            }
            pack::unpack(packed_body, unpacked_size as usize)?
        },
        other => bail!("unknown packed-flag byte {other}"),
    };

    Ok(Some(unmarshal(&msg_bytes)?))
}
