//! Kernel TCP statistics (`TCP_INFO`, `TCP_CC_INFO`) for WebSocket connections.

use crate::error::StatsError;
use crate::transport::StatsSource;
use ndt7_model::Measurement;
use std::time::Duration;

/// Statistics source reading from a duplicated socket descriptor.
///
/// The duplicate keeps the socket readable for the whole subtest even
/// while the connection halves are being torn down.
pub struct TcpStats {
    #[cfg(target_os = "linux")]
    fd: Option<std::io::Result<std::os::fd::OwnedFd>>,
    bbr: bool,
}

impl TcpStats {
    #[cfg(target_os = "linux")]
    pub fn from_tcp(stream: &tokio::net::TcpStream) -> Self {
        use std::os::fd::AsFd;
        Self {
            fd: Some(stream.as_fd().try_clone_to_owned()),
            bbr: false,
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn from_tcp(_stream: &tokio::net::TcpStream) -> Self {
        Self::detached()
    }

    /// A source with nothing to read from; every sample stays empty.
    pub fn detached() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            fd: None,
            bbr: false,
        }
    }
}

#[cfg(target_os = "linux")]
impl StatsSource for TcpStats {
    fn prepare(&mut self) -> Result<(), StatsError> {
        match &self.fd {
            Some(Err(e)) => Err(StatsError::Syscall {
                op: "dup",
                source: std::io::Error::new(e.kind(), e.to_string()),
            }),
            _ => Ok(()),
        }
    }

    fn enable_congestion_control(&mut self) -> Result<(), StatsError> {
        use std::os::fd::AsRawFd;
        let Some(Ok(fd)) = &self.fd else {
            return Err(StatsError::Unsupported);
        };
        sys::set_congestion(fd.as_raw_fd(), b"bbr").map_err(|source| StatsError::Syscall {
            op: "setsockopt(TCP_CONGESTION)",
            source,
        })?;
        self.bbr = true;
        Ok(())
    }

    fn sample(&mut self, elapsed: Duration, m: &mut Measurement) {
        use std::os::fd::AsRawFd;
        let Some(Ok(fd)) = &self.fd else {
            return;
        };
        let elapsed_us = elapsed.as_micros() as i64;
        // BBR first, so TCP_INFO tells whether the connection was already gone.
        if self.bbr {
            if let Ok(info) = sys::bbr_info(fd.as_raw_fd()) {
                m.bbr_info = Some(info.into_model(elapsed_us));
            }
        }
        if let Ok(info) = sys::tcp_info(fd.as_raw_fd()) {
            m.tcp_info = Some(info.into_model(elapsed_us));
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl StatsSource for TcpStats {
    fn prepare(&mut self) -> Result<(), StatsError> {
        Ok(())
    }

    fn enable_congestion_control(&mut self) -> Result<(), StatsError> {
        Err(StatsError::Unsupported)
    }

    fn sample(&mut self, _elapsed: Duration, _m: &mut Measurement) {}
}

#[cfg(target_os = "linux")]
mod sys {
    use ndt7_model::{BbrInfo, TcpInfo};
    use std::io;
    use std::mem;
    use std::os::fd::RawFd;

    const TCP_CC_INFO: libc::c_int = 26;

    /// Layout of `struct tcp_info` up to `tcpi_reord_seen`. Older kernels
    /// fill a prefix; the rest stays zero.
    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub(super) struct RawTcpInfo {
        state: u8,
        ca_state: u8,
        retransmits: u8,
        probes: u8,
        backoff: u8,
        options: u8,
        wscale: u8,
        app_limited: u8,
        rto: u32,
        ato: u32,
        snd_mss: u32,
        rcv_mss: u32,
        unacked: u32,
        sacked: u32,
        lost: u32,
        retrans: u32,
        fackets: u32,
        last_data_sent: u32,
        last_ack_sent: u32,
        last_data_recv: u32,
        last_ack_recv: u32,
        pmtu: u32,
        rcv_ssthresh: u32,
        rtt: u32,
        rttvar: u32,
        snd_ssthresh: u32,
        snd_cwnd: u32,
        advmss: u32,
        reordering: u32,
        rcv_rtt: u32,
        rcv_space: u32,
        total_retrans: u32,
        pacing_rate: u64,
        max_pacing_rate: u64,
        bytes_acked: u64,
        bytes_received: u64,
        segs_out: u32,
        segs_in: u32,
        notsent_bytes: u32,
        min_rtt: u32,
        data_segs_in: u32,
        data_segs_out: u32,
        delivery_rate: u64,
        busy_time: u64,
        rwnd_limited: u64,
        sndbuf_limited: u64,
        delivered: u32,
        delivered_ce: u32,
        bytes_sent: u64,
        bytes_retrans: u64,
        dsack_dups: u32,
        reord_seen: u32,
    }

    impl RawTcpInfo {
        pub(super) fn into_model(self, elapsed_us: i64) -> TcpInfo {
            TcpInfo {
                state: self.state,
                ca_state: self.ca_state,
                retransmits: self.retransmits,
                probes: self.probes,
                backoff: self.backoff,
                options: self.options,
                wscale: self.wscale,
                app_limited: self.app_limited & 1,
                rto: self.rto,
                ato: self.ato,
                snd_mss: self.snd_mss,
                rcv_mss: self.rcv_mss,
                unacked: self.unacked,
                sacked: self.sacked,
                lost: self.lost,
                retrans: self.retrans,
                last_data_sent: self.last_data_sent,
                last_ack_sent: self.last_ack_sent,
                last_data_recv: self.last_data_recv,
                last_ack_recv: self.last_ack_recv,
                pmtu: self.pmtu,
                rcv_ss_thresh: self.rcv_ssthresh,
                rtt: self.rtt,
                rtt_var: self.rttvar,
                snd_ss_thresh: self.snd_ssthresh,
                snd_cwnd: self.snd_cwnd,
                adv_mss: self.advmss,
                reordering: self.reordering,
                rcv_rtt: self.rcv_rtt,
                rcv_space: self.rcv_space,
                total_retrans: self.total_retrans,
                pacing_rate: self.pacing_rate as i64,
                max_pacing_rate: self.max_pacing_rate as i64,
                bytes_acked: self.bytes_acked as i64,
                bytes_received: self.bytes_received as i64,
                segs_out: self.segs_out as i32,
                segs_in: self.segs_in as i32,
                notsent_bytes: self.notsent_bytes as i32,
                min_rtt: self.min_rtt as i32,
                data_segs_in: self.data_segs_in as i32,
                data_segs_out: self.data_segs_out as i32,
                delivery_rate: self.delivery_rate as i64,
                busy_time: self.busy_time as i64,
                rwnd_limited: self.rwnd_limited as i64,
                snd_buf_limited: self.sndbuf_limited as i64,
                delivered: self.delivered as i32,
                delivered_ce: self.delivered_ce as i32,
                bytes_sent: self.bytes_sent as i64,
                bytes_retrans: self.bytes_retrans as i64,
                dsack_dups: self.dsack_dups as i32,
                reord_seen: self.reord_seen as i32,
                elapsed_time: elapsed_us,
            }
        }
    }

    /// `struct tcp_bbr_info`.
    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub(super) struct RawBbrInfo {
        bw_lo: u32,
        bw_hi: u32,
        min_rtt: u32,
        pacing_gain: u32,
        cwnd_gain: u32,
    }

    impl RawBbrInfo {
        pub(super) fn into_model(self, elapsed_us: i64) -> BbrInfo {
            let bw = (u64::from(self.bw_hi) << 32) | u64::from(self.bw_lo);
            BbrInfo {
                bw: bw as i64,
                min_rtt: self.min_rtt,
                pacing_gain: self.pacing_gain,
                cwnd_gain: self.cwnd_gain,
                elapsed_time: elapsed_us,
            }
        }
    }

    fn getsockopt<T: Default>(fd: RawFd, opt: libc::c_int) -> io::Result<(T, usize)> {
        let mut value = T::default();
        let mut len = mem::size_of::<T>() as libc::socklen_t;
        // SAFETY: `value` is a plain `repr(C)` struct of `len` bytes that
        // outlives the call, and the kernel writes at most `len` bytes.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                opt,
                (&mut value as *mut T).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((value, len as usize))
    }

    pub(super) fn tcp_info(fd: RawFd) -> io::Result<RawTcpInfo> {
        getsockopt::<RawTcpInfo>(fd, libc::TCP_INFO).map(|(info, _)| info)
    }

    pub(super) fn bbr_info(fd: RawFd) -> io::Result<RawBbrInfo> {
        let (info, len) = getsockopt::<RawBbrInfo>(fd, TCP_CC_INFO)?;
        if len < mem::size_of::<RawBbrInfo>() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "short tcp_bbr_info",
            ));
        }
        Ok(info)
    }

    pub(super) fn set_congestion(fd: RawFd, name: &[u8]) -> io::Result<()> {
        // SAFETY: `name` is valid for `name.len()` bytes for the whole call.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_CONGESTION,
                name.as_ptr().cast::<libc::c_void>(),
                name.len() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
