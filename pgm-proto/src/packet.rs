//! PGM wire packets per RFC 3208 section 8.
//!
//! Every PGM packet starts with a 16-byte header in network byte order:
//! source port, destination port, type, option flags, checksum, GSI, and
//! TSDU length. Bodies follow per type, with optional option extensions.
//! Decoding verifies the checksum; encoding fills it in.

use crate::checksum;
use crate::error::WireError;
use crate::gsi::{Gsi, Tsi};
use crate::options::OptionSet;
use crate::sqn::Sqn;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const HEADER_LEN: usize = 16;

/// Address family indicators for network-layer addresses (RFC 1700).
pub const AFI_IPV4: u16 = 1;
pub const AFI_IPV6: u16 = 2;

/// Header option-flag bits.
pub const OPT_PRESENT: u8 = 0x01;
pub const OPT_NETWORK: u8 = 0x02;
pub const OPT_VAR_PKTLEN: u8 = 0x40;
pub const OPT_PARITY: u8 = 0x80;

/// PGM packet types, as carried in the header type octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Spm = 0x00,
    Poll = 0x01,
    Polr = 0x02,
    Odata = 0x04,
    Rdata = 0x05,
    Nak = 0x08,
    NullNak = 0x09,
    Ncf = 0x0a,
    Spmr = 0x0c,
    Ack = 0x0d,
}

impl PacketType {
    pub fn from_wire(byte: u8) -> Result<Self, WireError> {
        match byte & 0x0f {
            0x00 => Ok(PacketType::Spm),
            0x01 => Ok(PacketType::Poll),
            0x02 => Ok(PacketType::Polr),
            0x04 => Ok(PacketType::Odata),
            0x05 => Ok(PacketType::Rdata),
            0x08 => Ok(PacketType::Nak),
            0x09 => Ok(PacketType::NullNak),
            0x0a => Ok(PacketType::Ncf),
            0x0c => Ok(PacketType::Spmr),
            0x0d => Ok(PacketType::Ack),
            other => Err(WireError::UnknownType(other)),
        }
    }

    /// Upstream packets travel unicast toward the source; downstream packets
    /// are multicast to the group.
    pub fn is_upstream(self) -> bool {
        matches!(
            self,
            PacketType::Nak | PacketType::NullNak | PacketType::Spmr | PacketType::Ack
        )
    }
}

/// The fixed PGM header common to every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgmHeader {
    pub sport: u16,
    pub dport: u16,
    pub packet_type: PacketType,
    pub flags: u8,
    pub gsi: Gsi,
    pub tsdu_len: u16,
}

impl PgmHeader {
    /// The TSI of the publishing session this packet belongs to. For
    /// upstream packets (NAK, SPMR, ACK) the session port is the
    /// *destination* port; for downstream packets it is the source port.
    pub fn tsi(&self) -> Tsi {
        if self.packet_type.is_upstream() {
            Tsi::new(self.gsi, self.dport)
        } else {
            Tsi::new(self.gsi, self.sport)
        }
    }
}

/// Source Path Message: advertises the source NLA and the window edges, and
/// carries session control options (SYN, FIN, RST, parity parameters).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spm {
    pub spm_sqn: Sqn,
    pub trail: Sqn,
    pub lead: Sqn,
    pub nla: IpAddr,
    pub options: OptionSet,
}

/// ODATA / RDATA: one TSDU with the window trailing edge piggybacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub sqn: Sqn,
    pub trail: Sqn,
    pub options: OptionSet,
    pub payload: Vec<u8>,
}

impl DataPacket {
    pub fn fragment(&self) -> Option<&crate::options::OptFragment> {
        self.options.fragment.as_ref()
    }
}

/// NAK / N-NAK / NCF: the requested (or confirmed) sequence number plus the
/// source and group NLAs, with up to 62 additional sqns in OPT_NAK_LIST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakPacket {
    pub sqn: Sqn,
    pub src_nla: IpAddr,
    pub grp_nla: IpAddr,
    pub options: OptionSet,
}

/// SPM Request: bodyless; solicits an immediate SPM from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spmr {
    pub options: OptionSet,
}

/// PGMCC acknowledgement. Parsed and counted; no congestion-control state
/// is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub rx_max: Sqn,
    pub bitmap: u32,
    pub options: OptionSet,
}

/// POLL: a source probe of the receiver population.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poll {
    pub sqn: Sqn,
    pub round: u16,
    pub subtype: u16,
    pub nla: IpAddr,
    pub bo_ivl: u32,
    pub rand: [u8; 4],
    pub mask: u32,
    pub options: OptionSet,
}

/// POLR: a receiver's answer to a POLL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polr {
    pub sqn: Sqn,
    pub round: u16,
    pub options: OptionSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Spm(Spm),
    Odata(DataPacket),
    Rdata(DataPacket),
    Nak(NakPacket),
    NullNak(NakPacket),
    Ncf(NakPacket),
    Spmr(Spmr),
    Ack(Ack),
    Poll(Poll),
    Polr(Polr),
}

impl PacketBody {
    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketBody::Spm(_) => PacketType::Spm,
            PacketBody::Odata(_) => PacketType::Odata,
            PacketBody::Rdata(_) => PacketType::Rdata,
            PacketBody::Nak(_) => PacketType::Nak,
            PacketBody::NullNak(_) => PacketType::NullNak,
            PacketBody::Ncf(_) => PacketType::Ncf,
            PacketBody::Spmr(_) => PacketType::Spmr,
            PacketBody::Ack(_) => PacketType::Ack,
            PacketBody::Poll(_) => PacketType::Poll,
            PacketBody::Polr(_) => PacketType::Polr,
        }
    }

    fn options(&self) -> &OptionSet {
        match self {
            PacketBody::Spm(p) => &p.options,
            PacketBody::Odata(p) | PacketBody::Rdata(p) => &p.options,
            PacketBody::Nak(p) | PacketBody::NullNak(p) | PacketBody::Ncf(p) => &p.options,
            PacketBody::Spmr(p) => &p.options,
            PacketBody::Ack(p) => &p.options,
            PacketBody::Poll(p) => &p.options,
            PacketBody::Polr(p) => &p.options,
        }
    }
}

/// A decoded (or to-be-encoded) PGM packet: fixed header plus typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgmPacket {
    pub header: PgmHeader,
    pub body: PacketBody,
}

impl PgmPacket {
    pub fn new(sport: u16, dport: u16, gsi: Gsi, body: PacketBody) -> Self {
        let tsdu_len = match &body {
            PacketBody::Odata(d) | PacketBody::Rdata(d) => d.payload.len() as u16,
            _ => 0,
        };
        let mut flags = 0u8;
        if !body.options().is_empty() {
            flags |= OPT_PRESENT;
        }
        PgmPacket {
            header: PgmHeader {
                sport,
                dport,
                packet_type: body.packet_type(),
                flags,
                gsi,
                tsdu_len,
            },
            body,
        }
    }

    pub fn tsi(&self) -> Tsi {
        self.header.tsi()
    }

    /// Serializes the packet and fills in the checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 64);
        buf.extend_from_slice(&self.header.sport.to_be_bytes());
        buf.extend_from_slice(&self.header.dport.to_be_bytes());
        buf.push(self.header.packet_type as u8);
        buf.push(self.header.flags);
        buf.extend_from_slice(&[0, 0]); // checksum placeholder
        buf.extend_from_slice(self.header.gsi.as_bytes());
        buf.extend_from_slice(&self.header.tsdu_len.to_be_bytes());

        match &self.body {
            PacketBody::Spm(spm) => {
                buf.extend_from_slice(&spm.spm_sqn.0.to_be_bytes());
                buf.extend_from_slice(&spm.trail.0.to_be_bytes());
                buf.extend_from_slice(&spm.lead.0.to_be_bytes());
                put_nla(&mut buf, spm.nla);
                spm.options.encode(&mut buf);
            }
            PacketBody::Odata(data) | PacketBody::Rdata(data) => {
                buf.extend_from_slice(&data.sqn.0.to_be_bytes());
                buf.extend_from_slice(&data.trail.0.to_be_bytes());
                data.options.encode(&mut buf);
                buf.extend_from_slice(&data.payload);
            }
            PacketBody::Nak(nak) | PacketBody::NullNak(nak) | PacketBody::Ncf(nak) => {
                buf.extend_from_slice(&nak.sqn.0.to_be_bytes());
                put_nla(&mut buf, nak.src_nla);
                put_nla(&mut buf, nak.grp_nla);
                nak.options.encode(&mut buf);
            }
            PacketBody::Spmr(spmr) => {
                spmr.options.encode(&mut buf);
            }
            PacketBody::Ack(ack) => {
                buf.extend_from_slice(&ack.rx_max.0.to_be_bytes());
                buf.extend_from_slice(&ack.bitmap.to_be_bytes());
                ack.options.encode(&mut buf);
            }
            PacketBody::Poll(poll) => {
                buf.extend_from_slice(&poll.sqn.0.to_be_bytes());
                buf.extend_from_slice(&poll.round.to_be_bytes());
                buf.extend_from_slice(&poll.subtype.to_be_bytes());
                put_nla(&mut buf, poll.nla);
                buf.extend_from_slice(&poll.bo_ivl.to_be_bytes());
                buf.extend_from_slice(&poll.rand);
                buf.extend_from_slice(&poll.mask.to_be_bytes());
                poll.options.encode(&mut buf);
            }
            PacketBody::Polr(polr) => {
                buf.extend_from_slice(&polr.sqn.0.to_be_bytes());
                buf.extend_from_slice(&polr.round.to_be_bytes());
                buf.extend_from_slice(&[0, 0]);
                polr.options.encode(&mut buf);
            }
        }

        let sum = checksum::inet(&buf, 0);
        buf[6..8].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    /// Parses and validates a received PGM packet. The checksum must verify;
    /// a zero checksum field is only tolerated on non-data packets.
    pub fn decode(buf: &[u8]) -> Result<PgmPacket, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                need: HEADER_LEN,
                have: buf.len(),
            });
        }

        let packet_type = PacketType::from_wire(buf[4])?;
        let transmitted_sum = u16::from_be_bytes([buf[6], buf[7]]);
        if transmitted_sum == 0 {
            if matches!(packet_type, PacketType::Odata | PacketType::Rdata) {
                return Err(WireError::BadChecksum);
            }
        } else if !checksum::verify(buf) {
            return Err(WireError::BadChecksum);
        }

        let mut gsi = [0u8; 6];
        gsi.copy_from_slice(&buf[8..14]);
        let header = PgmHeader {
            sport: u16::from_be_bytes([buf[0], buf[1]]),
            dport: u16::from_be_bytes([buf[2], buf[3]]),
            packet_type,
            flags: buf[5],
            gsi: Gsi::from_bytes(gsi),
            tsdu_len: u16::from_be_bytes([buf[14], buf[15]]),
        };

        let mut rd = Reader {
            buf,
            pos: HEADER_LEN,
        };
        let has_options = header.flags & OPT_PRESENT != 0;

        let body = match packet_type {
            PacketType::Spm => {
                let spm_sqn = Sqn(rd.u32()?);
                let trail = Sqn(rd.u32()?);
                let lead = Sqn(rd.u32()?);
                let nla = rd.nla()?;
                let options = rd.options(has_options)?;
                PacketBody::Spm(Spm {
                    spm_sqn,
                    trail,
                    lead,
                    nla,
                    options,
                })
            }
            PacketType::Odata | PacketType::Rdata => {
                let sqn = Sqn(rd.u32()?);
                let trail = Sqn(rd.u32()?);
                let options = rd.options(has_options)?;
                let tsdu = header.tsdu_len as usize;
                if rd.remaining() < tsdu {
                    return Err(WireError::BadTsduLength { tsdu });
                }
                let payload = rd.take(tsdu)?.to_vec();
                let data = DataPacket {
                    sqn,
                    trail,
                    options,
                    payload,
                };
                if packet_type == PacketType::Odata {
                    PacketBody::Odata(data)
                } else {
                    PacketBody::Rdata(data)
                }
            }
            PacketType::Nak | PacketType::NullNak | PacketType::Ncf => {
                let sqn = Sqn(rd.u32()?);
                let src_nla = rd.nla()?;
                let grp_nla = rd.nla()?;
                let options = rd.options(has_options)?;
                let nak = NakPacket {
                    sqn,
                    src_nla,
                    grp_nla,
                    options,
                };
                match packet_type {
                    PacketType::Nak => PacketBody::Nak(nak),
                    PacketType::NullNak => PacketBody::NullNak(nak),
                    _ => PacketBody::Ncf(nak),
                }
            }
            PacketType::Spmr => PacketBody::Spmr(Spmr {
                options: rd.options(has_options)?,
            }),
            PacketType::Ack => {
                let rx_max = Sqn(rd.u32()?);
                let bitmap = rd.u32()?;
                let options = rd.options(has_options)?;
                PacketBody::Ack(Ack {
                    rx_max,
                    bitmap,
                    options,
                })
            }
            PacketType::Poll => {
                let sqn = Sqn(rd.u32()?);
                let round = rd.u16()?;
                let subtype = rd.u16()?;
                let nla = rd.nla()?;
                let bo_ivl = rd.u32()?;
                let mut rand = [0u8; 4];
                rand.copy_from_slice(rd.take(4)?);
                let mask = rd.u32()?;
                let options = rd.options(has_options)?;
                PacketBody::Poll(Poll {
                    sqn,
                    round,
                    subtype,
                    nla,
                    bo_ivl,
                    rand,
                    mask,
                    options,
                })
            }
            PacketType::Polr => {
                let sqn = Sqn(rd.u32()?);
                let round = rd.u16()?;
                let _reserved = rd.u16()?;
                let options = rd.options(has_options)?;
                PacketBody::Polr(Polr { sqn, round, options })
            }
        };

        let packet = PgmPacket { header, body };
        if packet.body.options().syn && packet.body.options().fin {
            return Err(WireError::ConflictingOptions("OPT_SYN with OPT_FIN"));
        }
        Ok(packet)
    }
}

fn put_nla(buf: &mut Vec<u8>, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            buf.extend_from_slice(&AFI_IPV4.to_be_bytes());
            buf.extend_from_slice(&[0, 0]);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.extend_from_slice(&AFI_IPV6.to_be_bytes());
            buf.extend_from_slice(&[0, 0]);
            buf.extend_from_slice(&v6.octets());
        }
    }
}

pub(crate) struct Reader<'a> {
    pub buf: &'a [u8],
    pub pos: usize,
}

impl<'a> Reader<'a> {
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                need: self.pos + n,
                have: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn nla(&mut self) -> Result<IpAddr, WireError> {
        let afi = self.u16()?;
        let _reserved = self.u16()?;
        match afi {
            AFI_IPV4 => {
                let b = self.take(4)?;
                Ok(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])))
            }
            AFI_IPV6 => {
                let b = self.take(16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(b);
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            other => Err(WireError::UnknownAfi(other)),
        }
    }

    fn options(&mut self, present: bool) -> Result<OptionSet, WireError> {
        if !present {
            return Ok(OptionSet::default());
        }
        OptionSet::decode(self)
    }
}
