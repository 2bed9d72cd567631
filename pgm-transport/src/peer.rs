//! Per-source receiver state.
//!
//! A peer is created on the first packet from an unknown TSI and owns that
//! session's receive window, the source's advertised NLA, and the liveness
//! and SPMR-solicitation timers. The endpoint's peer map is authoritative;
//! peers hold no references back into the endpoint.

use crate::rxw::{ReceiveWindow, RxwConfig};
use pgm_proto::{Sqn, Tsi};
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Peer {
    pub tsi: Tsi,
    /// Source NLA learned from SPMs; NAKs cannot be addressed without it.
    pub nla: Option<IpAddr>,
    pub rxw: ReceiveWindow,
    /// Highest SPM sequence seen; older SPMs are stale and dropped.
    pub spm_sqn: Option<Sqn>,
    pub last_activity: Instant,
    /// When to solicit the source path with an SPMR; cleared once an SPM
    /// arrives, pushed back when another receiver's SPMR is overheard.
    pub spmr_deadline: Option<Instant>,
    pub fin_seen: bool,
    /// Session aborted by OPT_RST; surfaced once as a reset.
    pub reset_pending: bool,
}

impl Peer {
    pub fn new(tsi: Tsi, rxw_config: RxwConfig, now: Instant, spmr_after: Duration) -> Self {
        Peer {
            tsi,
            nla: None,
            rxw: ReceiveWindow::new(tsi, rxw_config),
            spm_sqn: None,
            last_activity: now,
            spmr_deadline: Some(now + spmr_after),
            fin_seen: false,
            reset_pending: false,
        }
    }

    /// Accepts an SPM sequence number if it advances the last seen one.
    pub fn accept_spm(&mut self, sqn: Sqn) -> bool {
        match self.spm_sqn {
            Some(prev) if !sqn.gt(prev) => false,
            _ => {
                self.spm_sqn = Some(sqn);
                true
            }
        }
    }

    pub fn is_expired(&self, now: Instant, expiry: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= expiry
            && !self.rxw.has_pending()
    }
}
