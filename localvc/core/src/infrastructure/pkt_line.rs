// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! pkt-line framing used by the git wire protocol.
//!
//! Every packet starts with a four digit hex length that includes the prefix
//! itself. `0000` is a flush packet; `0001` and `0002` are the protocol v2
//! delimiter and response-end packets.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::infrastructure::protocol::ProtocolError;

/// Largest packet allowed on the wire, including the length prefix.
pub const MAX_PKT_LEN: usize = 65520;
pub const FLUSH_PKT: &[u8] = b"0000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Flush,
    Delim,
    ResponseEnd,
    Data(Vec<u8>),
}

/// Append one data packet to `buf`.
pub fn write_pkt(buf: &mut Vec<u8>, data: &[u8]) -> Result<(), ProtocolError> {
    let len = data.len() + 4;
    if len > MAX_PKT_LEN {
        return Err(ProtocolError::Malformed(format!("packet of {} bytes exceeds limit", len)));
    }
    buf.extend_from_slice(format!("{:04x}", len).as_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

/// Append a text packet, terminated by a newline.
pub fn write_line(buf: &mut Vec<u8>, line: &str) -> Result<(), ProtocolError> {
    let mut data = Vec::with_capacity(line.len() + 1);
    data.extend_from_slice(line.as_bytes());
    data.push(b'\n');
    write_pkt(buf, &data)
}

pub fn write_flush(buf: &mut Vec<u8>) {
    buf.extend_from_slice(FLUSH_PKT);
}

/// Read the next packet. Returns `Ok(None)` on a clean EOF before any byte.
pub async fn read_pkt<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Packet>, ProtocolError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::Malformed("truncated packet length".to_string()))
            };
        }
        filled += n;
    }

    let len_str = std::str::from_utf8(&header)
        .map_err(|_| ProtocolError::Malformed("non-ascii packet length".to_string()))?;
    let len = usize::from_str_radix(len_str, 16)
        .map_err(|_| ProtocolError::Malformed(format!("invalid packet length '{}'", len_str)))?;

    match len {
        0 => Ok(Some(Packet::Flush)),
        1 => Ok(Some(Packet::Delim)),
        2 => Ok(Some(Packet::ResponseEnd)),
        3 => Err(ProtocolError::Malformed("invalid packet length 3".to_string())),
        len if len > MAX_PKT_LEN => Err(ProtocolError::Malformed(format!("packet length {} exceeds limit", len))),
        len => {
            let mut data = vec![0u8; len - 4];
            reader.read_exact(&mut data).await?;
            Ok(Some(Packet::Data(data)))
        }
    }
}

/// Strip one trailing newline from a text packet.
pub fn trim_line(data: &[u8]) -> &[u8] {
    data.strip_suffix(b"\n").unwrap_or(data)
}
