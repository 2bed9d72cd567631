//! PGM option extensions (RFC 3208 section 9).
//!
//! Options trail the packet body as a chain: OPT_LENGTH first (carrying the
//! total length of the chain), then one option per entry, the last flagged
//! with the OPT_END bit. Each entry is `type, length, reserved` followed by
//! its payload, lengths inclusive of the 3-byte entry header.

use crate::error::WireError;
use crate::packet::Reader;
use crate::sqn::Sqn;
use smallvec::SmallVec;

pub const OPT_LENGTH: u8 = 0x00;
pub const OPT_FRAGMENT: u8 = 0x01;
pub const OPT_NAK_LIST: u8 = 0x02;
pub const OPT_JOIN: u8 = 0x03;
pub const OPT_NAK_BO_IVL: u8 = 0x04;
pub const OPT_PARITY_PRM: u8 = 0x08;
pub const OPT_PARITY_GRP: u8 = 0x09;
pub const OPT_CURR_TGSIZE: u8 = 0x0a;
pub const OPT_SYN: u8 = 0x0d;
pub const OPT_FIN: u8 = 0x0e;
pub const OPT_RST: u8 = 0x0f;

pub const OPT_END: u8 = 0x80;
const OPT_MASK: u8 = 0x7f;

/// Maximum additional sqns in one OPT_NAK_LIST entry.
pub const NAK_LIST_MAX: usize = 62;

/// OPT_PARITY_PRM flag: proactive parity enabled.
pub const PARITY_PRM_PRO: u8 = 0x01;
/// OPT_PARITY_PRM flag: on-demand parity enabled.
pub const PARITY_PRM_OND: u8 = 0x02;

/// Fragmentation descriptor: identifies the APDU (by the sqn of fragment 0)
/// and this fragment's place in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptFragment {
    pub apdu_first_sqn: Sqn,
    pub offset: u32,
    pub apdu_len: u32,
}

/// Parity parameters advertised by a source in its SPMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptParityPrm {
    pub flags: u8,
    pub group_size: u32,
}

impl OptParityPrm {
    pub fn proactive(&self) -> bool {
        self.flags & PARITY_PRM_PRO != 0
    }

    pub fn ondemand(&self) -> bool {
        self.flags & PARITY_PRM_OND != 0
    }
}

/// The parsed option extensions of one packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OptionSet {
    pub fragment: Option<OptFragment>,
    pub nak_list: SmallVec<[Sqn; 4]>,
    pub join: Option<Sqn>,
    pub nak_bo_ivl: Option<u32>,
    pub parity_prm: Option<OptParityPrm>,
    pub parity_grp: Option<u32>,
    pub curr_tgsize: Option<u32>,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

impl OptionSet {
    pub fn is_empty(&self) -> bool {
        self.fragment.is_none()
            && self.nak_list.is_empty()
            && self.join.is_none()
            && self.nak_bo_ivl.is_none()
            && self.parity_prm.is_none()
            && self.parity_grp.is_none()
            && self.curr_tgsize.is_none()
            && !self.syn
            && !self.fin
            && !self.rst
    }

    fn encoded_len(&self) -> usize {
        let mut len = 4; // OPT_LENGTH
        if self.fragment.is_some() {
            len += 16;
        }
        if !self.nak_list.is_empty() {
            len += 4 + 4 * self.nak_list.len().min(NAK_LIST_MAX);
        }
        if self.join.is_some() {
            len += 8;
        }
        if self.nak_bo_ivl.is_some() {
            len += 8;
        }
        if self.parity_prm.is_some() {
            len += 8;
        }
        if self.parity_grp.is_some() {
            len += 8;
        }
        if self.curr_tgsize.is_some() {
            len += 8;
        }
        for flag in [self.syn, self.fin, self.rst] {
            if flag {
                len += 4;
            }
        }
        len
    }

    /// Appends the encoded option chain to `buf`. No-op when empty.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        if self.is_empty() {
            return;
        }
        let total = self.encoded_len() as u16;
        buf.push(OPT_LENGTH);
        buf.push(4);
        buf.extend_from_slice(&total.to_be_bytes());

        // Collect entries so the final one can take the OPT_END bit.
        let mut entries: Vec<Vec<u8>> = Vec::new();
        if let Some(frag) = &self.fragment {
            let mut e = vec![OPT_FRAGMENT, 16, 0, 0];
            e.extend_from_slice(&frag.apdu_first_sqn.0.to_be_bytes());
            e.extend_from_slice(&frag.offset.to_be_bytes());
            e.extend_from_slice(&frag.apdu_len.to_be_bytes());
            entries.push(e);
        }
        if !self.nak_list.is_empty() {
            let count = self.nak_list.len().min(NAK_LIST_MAX);
            let mut e = vec![OPT_NAK_LIST, (4 + 4 * count) as u8, 0, 0];
            for sqn in self.nak_list.iter().take(count) {
                e.extend_from_slice(&sqn.0.to_be_bytes());
            }
            entries.push(e);
        }
        if let Some(join) = self.join {
            let mut e = vec![OPT_JOIN, 8, 0, 0];
            e.extend_from_slice(&join.0.to_be_bytes());
            entries.push(e);
        }
        if let Some(ivl) = self.nak_bo_ivl {
            let mut e = vec![OPT_NAK_BO_IVL, 8, 0, 0];
            e.extend_from_slice(&ivl.to_be_bytes());
            entries.push(e);
        }
        if let Some(prm) = &self.parity_prm {
            let mut e = vec![OPT_PARITY_PRM, 8, 0, prm.flags];
            e.extend_from_slice(&prm.group_size.to_be_bytes());
            entries.push(e);
        }
        if let Some(grp) = self.parity_grp {
            let mut e = vec![OPT_PARITY_GRP, 8, 0, 0];
            e.extend_from_slice(&grp.to_be_bytes());
            entries.push(e);
        }
        if let Some(tg) = self.curr_tgsize {
            let mut e = vec![OPT_CURR_TGSIZE, 8, 0, 0];
            e.extend_from_slice(&tg.to_be_bytes());
            entries.push(e);
        }
        if self.syn {
            entries.push(vec![OPT_SYN, 4, 0, 0]);
        }
        if self.fin {
            entries.push(vec![OPT_FIN, 4, 0, 0]);
        }
        if self.rst {
            entries.push(vec![OPT_RST, 4, 0, 0]);
        }

        let last = entries.len().saturating_sub(1);
        for (i, mut entry) in entries.into_iter().enumerate() {
            if i == last {
                entry[0] |= OPT_END;
            }
            buf.extend_from_slice(&entry);
        }
    }

    /// Parses an option chain at the reader's position. The chain must open
    /// with OPT_LENGTH; unknown options are skipped by their length field.
    pub(crate) fn decode(rd: &mut Reader<'_>) -> Result<OptionSet, WireError> {
        let start = rd.pos;
        let head = rd.take(4)?;
        if head[0] & OPT_MASK != OPT_LENGTH || head[1] != 4 {
            return Err(WireError::MalformedOption(start));
        }
        let total = u16::from_be_bytes([head[2], head[3]]) as usize;
        if total < 4 || rd.buf.len() - start < total {
            return Err(WireError::MalformedOption(start));
        }
        let end = start + total;

        let mut set = OptionSet::default();
        let mut done = false;
        while rd.pos < end {
            if done {
                return Err(WireError::MalformedOption(rd.pos));
            }
            let at = rd.pos;
            let hdr = rd.take(2)?;
            let (opt_type, opt_len) = (hdr[0], hdr[1] as usize);
            if opt_len < 3 || at + opt_len > end {
                return Err(WireError::MalformedOption(at));
            }
            done = opt_type & OPT_END != 0;
            let body = rd.take(opt_len - 2)?;
            match opt_type & OPT_MASK {
                OPT_FRAGMENT => {
                    if opt_len != 16 {
                        return Err(WireError::MalformedOption(at));
                    }
                    set.fragment = Some(OptFragment {
                        apdu_first_sqn: Sqn(be32(&body[2..6])),
                        offset: be32(&body[6..10]),
                        apdu_len: be32(&body[10..14]),
                    });
                }
                OPT_NAK_LIST => {
                    if opt_len < 4 || (opt_len - 4) % 4 != 0 {
                        return Err(WireError::MalformedOption(at));
                    }
                    let count = (opt_len - 4) / 4;
                    if count > NAK_LIST_MAX {
                        return Err(WireError::MalformedOption(at));
                    }
                    for i in 0..count {
                        set.nak_list.push(Sqn(be32(&body[2 + 4 * i..6 + 4 * i])));
                    }
                }
                OPT_JOIN => {
                    if opt_len != 8 {
                        return Err(WireError::MalformedOption(at));
                    }
                    set.join = Some(Sqn(be32(&body[2..6])));
                }
                OPT_NAK_BO_IVL => {
                    if opt_len != 8 {
                        return Err(WireError::MalformedOption(at));
                    }
                    set.nak_bo_ivl = Some(be32(&body[2..6]));
                }
                OPT_PARITY_PRM => {
                    if opt_len != 8 {
                        return Err(WireError::MalformedOption(at));
                    }
                    set.parity_prm = Some(OptParityPrm {
                        flags: body[1],
                        group_size: be32(&body[2..6]),
                    });
                }
                OPT_PARITY_GRP => {
                    if opt_len != 8 {
                        return Err(WireError::MalformedOption(at));
                    }
                    set.parity_grp = Some(be32(&body[2..6]));
                }
                OPT_CURR_TGSIZE => {
                    if opt_len != 8 {
                        return Err(WireError::MalformedOption(at));
                    }
                    set.curr_tgsize = Some(be32(&body[2..6]));
                }
                OPT_SYN => set.syn = true,
                OPT_FIN => set.fin = true,
                OPT_RST => set.rst = true,
                _ => {} // unknown option: skipped by length
            }
        }
        if rd.pos != end || !done {
            return Err(WireError::MalformedOption(rd.pos));
        }
        Ok(set)
    }
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}
