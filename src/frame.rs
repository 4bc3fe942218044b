use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Ethertype under which transport frames travel on the virtual L2 network.
pub const ETHERTYPE: u16 = 0x0901;

pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Fixed frame header: op(1), flags(1), version(2 BE), zero(1),
///  dst_port(3 BE), zero(1), src_port(3 BE).
pub const HEADER_LEN: usize = 12;

/// Header plus the DATA-specific fields (msg_id, frag_sz, frag_no, nfrags).
pub const DATA_HEADER_LEN: usize = HEADER_LEN + 8;

/// Upper bound on the fragment count of a single message - the limit below
///  which `ceil(len / frag_sz)` must stay for a send to be accepted.
pub const MAX_FRAGS: usize = 0xfffe;

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Data = 0x00,
    DataMf = 0x01,
    ConnReq = 0x10,
    ConnAck = 0x12,
    DiscReq = 0x20,
    PingReq = 0x30,
    PingAck = 0x32,
    Error = 0x40,
}

/// Single-byte error codes carried in `ERROR` frames.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum WireErrorCode {
    Refused = 1,
    NotConn = 2,
    WrongSp = 3,
    Proto = 4,
    MsgSize = 5,
    Unknown = 6,
}

/// The fixed part of every frame. Parsed first so that routing (and error
///  replies to the identified sender) can happen even if the body is bad.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct FrameHeader {
    pub op: u8,
    pub dst_port: u32,
    pub src_port: u32,
}

impl FrameHeader {
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        let op = buf.try_get_u8()?;
        let flags = buf.try_get_u8()?;
        if flags != 0 {
            bail!("non-zero flags field: {:#x}", flags);
        }
        let version = buf.try_get_u16()?;
        if version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }
        let dst_port = buf.try_get_u32()?;
        if dst_port & 0xff00_0000 != 0 {
            bail!("reserved byte before dst port is not zero");
        }
        let src_port = buf.try_get_u32()?;
        if src_port & 0xff00_0000 != 0 {
            bail!("reserved byte before src port is not zero");
        }
        Ok(FrameHeader {
            op,
            dst_port,
            src_port,
        })
    }

    fn ser(op: Opcode, dst_port: u32, src_port: u32, buf: &mut impl BufMut) {
        debug_assert!(dst_port & 0xff00_0000 == 0);
        debug_assert!(src_port & 0xff00_0000 == 0);
        buf.put_u8(op.into());
        buf.put_u8(0);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u32(dst_port);
        buf.put_u32(src_port);
    }
}

#[derive(Clone, Eq, PartialEq)]
pub enum FrameKind {
    /// One fragment of an application message. The final fragment has
    ///  `frag_no == nfrags - 1` and goes out as opcode `DATA`; all earlier
    ///  fragments are `DATA_MF`.
    Data {
        msg_id: u16,
        frag_sz: u16,
        frag_no: u16,
        nfrags: u16,
        payload: Vec<u8>,
    },
    ConnReq {
        sp_proto: u16,
    },
    ConnAck {
        sp_proto: u16,
    },
    DiscReq,
    PingReq,
    PingAck,
    Error {
        code: WireErrorCode,
        reason: String,
    },
}

#[derive(Clone, Eq, PartialEq)]
pub struct Frame {
    pub dst_port: u32,
    pub src_port: u32,
    pub kind: FrameKind,
}

impl Frame {
    pub fn ser(&self, buf: &mut impl BufMut) {
        match &self.kind {
            FrameKind::Data {
                msg_id,
                frag_sz,
                frag_no,
                nfrags,
                payload,
            } => {
                let op = if frag_no + 1 < *nfrags {
                    Opcode::DataMf
                } else {
                    Opcode::Data
                };
                FrameHeader::ser(op, self.dst_port, self.src_port, buf);
                buf.put_u16(*msg_id);
                buf.put_u16(*frag_sz);
                buf.put_u16(*frag_no);
                buf.put_u16(*nfrags);
                buf.put_slice(payload);
            }
            FrameKind::ConnReq { sp_proto } => {
                FrameHeader::ser(Opcode::ConnReq, self.dst_port, self.src_port, buf);
                buf.put_u16(*sp_proto);
            }
            FrameKind::ConnAck { sp_proto } => {
                FrameHeader::ser(Opcode::ConnAck, self.dst_port, self.src_port, buf);
                buf.put_u16(*sp_proto);
            }
            FrameKind::DiscReq => {
                FrameHeader::ser(Opcode::DiscReq, self.dst_port, self.src_port, buf);
            }
            FrameKind::PingReq => {
                FrameHeader::ser(Opcode::PingReq, self.dst_port, self.src_port, buf);
            }
            FrameKind::PingAck => {
                FrameHeader::ser(Opcode::PingAck, self.dst_port, self.src_port, buf);
            }
            FrameKind::Error { code, reason } => {
                FrameHeader::ser(Opcode::Error, self.dst_port, self.src_port, buf);
                buf.put_u8((*code).into());
                buf.put_slice(reason.as_bytes());
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let header = FrameHeader::deser(buf)?;
        Self::deser_body(&header, buf)
    }

    /// Parses the opcode-specific body after the header was validated.
    pub fn deser_body(header: &FrameHeader, buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let Ok(op) = Opcode::try_from(header.op) else {
            bail!("unknown opcode {:#04x}", header.op);
        };

        let kind = match op {
            Opcode::Data | Opcode::DataMf => {
                let msg_id = buf.try_get_u16()?;
                let frag_sz = buf.try_get_u16()?;
                let frag_no = buf.try_get_u16()?;
                let nfrags = buf.try_get_u16()?;
                if msg_id == 0 {
                    bail!("message id 0 is reserved");
                }
                if nfrags == 0 || frag_sz == 0 {
                    bail!("degenerate fragment geometry: {} x {}", nfrags, frag_sz);
                }
                if frag_no >= nfrags {
                    bail!("fragment number {} out of range [0, {})", frag_no, nfrags);
                }
                match op {
                    Opcode::DataMf if frag_no + 1 >= nfrags => {
                        bail!("DATA_MF carrying the final fragment")
                    }
                    Opcode::Data if frag_no + 1 != nfrags => {
                        bail!("DATA carrying a non-final fragment")
                    }
                    _ => {}
                }
                let payload = buf.copy_to_bytes(buf.remaining()).to_vec();
                if op == Opcode::DataMf && payload.len() != frag_sz as usize {
                    bail!(
                        "non-final fragment length {} != fragment size {}",
                        payload.len(),
                        frag_sz
                    );
                }
                if payload.len() > frag_sz as usize {
                    bail!(
                        "fragment length {} exceeds fragment size {}",
                        payload.len(),
                        frag_sz
                    );
                }
                FrameKind::Data {
                    msg_id,
                    frag_sz,
                    frag_no,
                    nfrags,
                    payload,
                }
            }
            Opcode::ConnReq => FrameKind::ConnReq {
                sp_proto: buf.try_get_u16()?,
            },
            Opcode::ConnAck => FrameKind::ConnAck {
                sp_proto: buf.try_get_u16()?,
            },
            Opcode::DiscReq => FrameKind::DiscReq,
            Opcode::PingReq => FrameKind::PingReq,
            Opcode::PingAck => FrameKind::PingAck,
            Opcode::Error => {
                let raw = buf.try_get_u8()?;
                let code = WireErrorCode::try_from(raw).unwrap_or(WireErrorCode::Unknown);
                let reason =
                    String::from_utf8_lossy(&buf.copy_to_bytes(buf.remaining())).into_owned();
                FrameKind::Error { code, reason }
            }
        };

        Ok(Frame {
            dst_port: header.dst_port,
            src_port: header.src_port,
            kind,
        })
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FRM{{{:?} {}<-{}}}", self.kind, self.dst_port, self.src_port)
    }
}

impl Debug for FrameKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameKind::Data {
                msg_id,
                frag_no,
                nfrags,
                payload,
                ..
            } => write!(f, "DATA(#{} {}/{} len {})", msg_id, frag_no, nfrags, payload.len()),
            FrameKind::ConnReq { sp_proto } => write!(f, "CONN_REQ({})", sp_proto),
            FrameKind::ConnAck { sp_proto } => write!(f, "CONN_ACK({})", sp_proto),
            FrameKind::DiscReq => write!(f, "DISC_REQ"),
            FrameKind::PingReq => write!(f, "PING_REQ"),
            FrameKind::PingAck => write!(f, "PING_ACK"),
            FrameKind::Error { code, reason } => write!(f, "ERROR({:?}:{})", code, reason),
        }
    }
}
