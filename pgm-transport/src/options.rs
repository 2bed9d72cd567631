//! Socket options and resolved configuration.

use crate::error::PgmError;
use std::time::Duration;

/// Reed-Solomon parameters for a session, from the `UseFec` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecParams {
    /// Block size n (total symbols per transmission group).
    pub block_size: u8,
    /// Group size k (source symbols per transmission group).
    pub group_size: u8,
    /// Parity packets sent proactively after each complete group.
    pub proactive_packets: u8,
    /// Whether parity NAKs are answered with on-demand parity.
    pub ondemand: bool,
    /// Whether group packets vary in length (lengths embedded in symbols).
    pub var_pktlen: bool,
}

/// Socket options. Window sizing and capability options must be set before
/// `bind`; timer options may be adjusted at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockOpt {
    SendOnly(bool),
    RecvOnly(bool),
    /// Maximum TPDU, including PGM header.
    Mtu(usize),
    TxwSqns(u32),
    TxwSecs(u32),
    TxwMaxRte(u64),
    RxwSqns(u32),
    RxwSecs(u32),
    RxwMaxRte(u64),
    /// Repair-traffic rate bound.
    NakRte(u64),
    AmbientSpm(Duration),
    HeartbeatSpm(Vec<Duration>),
    NakBoIvl(Duration),
    NakRptIvl(Duration),
    NakRdataIvl(Duration),
    NakNcfRetries(u32),
    NakDataRetries(u32),
    PeerExpiry(Duration),
    SpmrExpiry(Duration),
    UseFec(FecParams),
    /// Cap on fragments per APDU.
    MaxApduFragments(u32),
    UdpEncapUcastPort(u16),
    UdpEncapMcastPort(u16),
    /// Deadline for blocking `recvmsg`; `None` blocks indefinitely.
    RecvTimeout(Option<Duration>),
    MulticastLoop(bool),
    MulticastTtl(u32),
}

/// Resolved configuration with protocol defaults.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub send_only: bool,
    pub recv_only: bool,
    pub max_tpdu: usize,
    pub txw_sqns: u32,
    pub txw_secs: u32,
    pub txw_max_rte: u64,
    pub rxw_sqns: u32,
    pub rxw_secs: u32,
    pub rxw_max_rte: u64,
    pub nak_rte: u64,
    pub ambient_spm: Duration,
    pub heartbeat_spm: Vec<Duration>,
    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_ncf_retries: u32,
    pub nak_data_retries: u32,
    pub peer_expiry: Duration,
    pub spmr_expiry: Duration,
    pub fec: Option<FecParams>,
    pub max_apdu_fragments: u32,
    pub udp_encap_ucast_port: u16,
    pub udp_encap_mcast_port: u16,
    pub recv_timeout: Option<Duration>,
    pub multicast_loop: bool,
    pub multicast_ttl: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            send_only: false,
            recv_only: false,
            max_tpdu: 1500,
            txw_sqns: 1024,
            txw_secs: 0,
            txw_max_rte: 0,
            rxw_sqns: 1024,
            rxw_secs: 0,
            rxw_max_rte: 0,
            nak_rte: 0,
            ambient_spm: Duration::from_secs(30),
            heartbeat_spm: vec![
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(1300),
                Duration::from_secs(7),
                Duration::from_secs(16),
                Duration::from_secs(25),
            ],
            nak_bo_ivl: Duration::from_millis(50),
            nak_rpt_ivl: Duration::from_millis(200),
            nak_rdata_ivl: Duration::from_secs(2),
            nak_ncf_retries: 50,
            nak_data_retries: 50,
            peer_expiry: Duration::from_secs(300),
            spmr_expiry: Duration::from_millis(250),
            fec: None,
            max_apdu_fragments: 16,
            udp_encap_ucast_port: 0,
            udp_encap_mcast_port: 0,
            recv_timeout: None,
            multicast_loop: false,
            multicast_ttl: 16,
        }
    }
}

impl SocketConfig {
    /// Applies one option, validating it. `bound` gates the options that
    /// cannot change after bind.
    pub fn apply(&mut self, opt: SockOpt, bound: bool) -> Result<(), PgmError> {
        let pre_bind_only = matches!(
            opt,
            SockOpt::SendOnly(_)
                | SockOpt::RecvOnly(_)
                | SockOpt::Mtu(_)
                | SockOpt::TxwSqns(_)
                | SockOpt::TxwSecs(_)
                | SockOpt::TxwMaxRte(_)
                | SockOpt::RxwSqns(_)
                | SockOpt::RxwSecs(_)
                | SockOpt::UseFec(_)
                | SockOpt::UdpEncapUcastPort(_)
                | SockOpt::UdpEncapMcastPort(_)
        );
        if bound && pre_bind_only {
            return Err(PgmError::Config(format!(
                "option {opt:?} cannot change after bind"
            )));
        }

        match opt {
            SockOpt::SendOnly(v) => self.send_only = v,
            SockOpt::RecvOnly(v) => self.recv_only = v,
            SockOpt::Mtu(v) => {
                if v < pgm_proto::HEADER_LEN + 64 {
                    return Err(PgmError::Config(format!("MTU {v} too small")));
                }
                self.max_tpdu = v;
            }
            SockOpt::TxwSqns(v) => {
                if v == 0 {
                    return Err(PgmError::Config("zero transmit window".into()));
                }
                self.txw_sqns = v;
            }
            SockOpt::TxwSecs(v) => self.txw_secs = v,
            SockOpt::TxwMaxRte(v) => self.txw_max_rte = v,
            SockOpt::RxwSqns(v) => {
                if v == 0 {
                    return Err(PgmError::Config("zero receive window".into()));
                }
                self.rxw_sqns = v;
            }
            SockOpt::RxwSecs(v) => self.rxw_secs = v,
            SockOpt::RxwMaxRte(v) => self.rxw_max_rte = v,
            SockOpt::NakRte(v) => self.nak_rte = v,
            SockOpt::AmbientSpm(v) => {
                if v.is_zero() {
                    return Err(PgmError::Config("zero ambient SPM interval".into()));
                }
                self.ambient_spm = v;
            }
            SockOpt::HeartbeatSpm(v) => self.heartbeat_spm = v,
            SockOpt::NakBoIvl(v) => self.nak_bo_ivl = v,
            SockOpt::NakRptIvl(v) => self.nak_rpt_ivl = v,
            SockOpt::NakRdataIvl(v) => self.nak_rdata_ivl = v,
            SockOpt::NakNcfRetries(v) => self.nak_ncf_retries = v,
            SockOpt::NakDataRetries(v) => self.nak_data_retries = v,
            SockOpt::PeerExpiry(v) => self.peer_expiry = v,
            SockOpt::SpmrExpiry(v) => self.spmr_expiry = v,
            SockOpt::UseFec(params) => {
                let n = params.block_size as usize;
                let k = params.group_size as usize;
                if k == 0 || k >= n {
                    return Err(PgmError::Config(format!("invalid RS({n}, {k})")));
                }
                if params.proactive_packets as usize > n - k {
                    return Err(PgmError::Config("more proactive packets than parity".into()));
                }
                self.fec = Some(params);
            }
            SockOpt::MaxApduFragments(v) => {
                if v == 0 {
                    return Err(PgmError::Config("zero APDU fragment limit".into()));
                }
                self.max_apdu_fragments = v;
            }
            SockOpt::UdpEncapUcastPort(v) => self.udp_encap_ucast_port = v,
            SockOpt::UdpEncapMcastPort(v) => self.udp_encap_mcast_port = v,
            SockOpt::RecvTimeout(v) => self.recv_timeout = v,
            SockOpt::MulticastLoop(v) => self.multicast_loop = v,
            SockOpt::MulticastTtl(v) => self.multicast_ttl = v,
        }
        Ok(())
    }

    /// Largest TSDU for an unfragmented APDU.
    pub fn max_tsdu(&self) -> usize {
        self.max_tpdu - pgm_proto::HEADER_LEN - 8 // sqn + trail
    }

    /// Largest TSDU per fragment of a fragmented APDU (OPT_LENGTH plus
    /// OPT_FRAGMENT overhead).
    pub fn max_tsdu_fragment(&self) -> usize {
        self.max_tsdu() - 20
    }

    /// Transmit window capacity in sequence numbers, either direct or
    /// derived from rate over time.
    pub fn txw_capacity(&self) -> usize {
        if self.txw_secs > 0 && self.txw_max_rte > 0 {
            let bytes = self.txw_max_rte.saturating_mul(self.txw_secs as u64);
            (bytes / self.max_tpdu as u64).max(1) as usize
        } else {
            self.txw_sqns as usize
        }
    }

    pub fn rxw_capacity(&self) -> usize {
        if self.rxw_secs > 0 && self.rxw_max_rte > 0 {
            let bytes = self.rxw_max_rte.saturating_mul(self.rxw_secs as u64);
            (bytes / self.max_tpdu as u64).max(1) as usize
        } else {
            self.rxw_sqns as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prebind_option_rejected_after_bind() {
        let mut cfg = SocketConfig::default();
        assert!(cfg.apply(SockOpt::Mtu(9000), true).is_err());
        assert_eq!(cfg.max_tpdu, 1500);
        assert!(cfg.apply(SockOpt::NakBoIvl(Duration::from_millis(20)), true).is_ok());
    }

    #[test]
    fn window_capacity_from_rate() {
        let mut cfg = SocketConfig::default();
        cfg.apply(SockOpt::TxwMaxRte(400_000), false).unwrap();
        cfg.apply(SockOpt::TxwSecs(30), false).unwrap();
        assert_eq!(cfg.txw_capacity(), 400_000 * 30 / 1500);
    }

    #[test]
    fn fec_params_validated() {
        let mut cfg = SocketConfig::default();
        let bad = FecParams {
            block_size: 8,
            group_size: 8,
            proactive_packets: 0,
            ondemand: true,
            var_pktlen: false,
        };
        assert!(cfg.apply(SockOpt::UseFec(bad), false).is_err());
    }
}
