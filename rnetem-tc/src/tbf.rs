//! Token Bucket Filter (tbf) qdisc requests.
//!
//! Tbf shapes a link leg to the configured rate. It attaches under the netem
//! qdisc when one exists, otherwise at the interface root.

use rtnetlink::packet_core::{
    NetlinkMessage, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST,
};
use rtnetlink::packet_route::{
    tc::{TcAttribute, TcHandle, TcMessage},
    RouteNetlinkMessage,
};

use crate::core::{MTU_ETHERNET, TICK_IN_USEC};
use crate::nla::{build_nested_options, build_nla};
use crate::qdisc::Impairment;

/// Default rate table for tbf (256 x 4-byte zero entries).
///
/// Modern kernels compute rates from precomputed `mult`/`shift` values and
/// only consult the table for linklayer auto-detection; `rtab[0] == 0` takes
/// the Ethernet fast path in `__detect_linklayer()`.
const DEFAULT_RATE_TABLE: [u8; 1024] = [0u8; 1024];

// TBF-specific TCA_OPTIONS sub-attributes, from <linux/pkt_sched.h>.
const TCA_TBF_PARMS: u16 = 1;
const TCA_TBF_RTAB: u16 = 2;
const TCA_TBF_BURST: u16 = 6;

/// Queuing budget used to size the tbf limit, matching iproute2's
/// `limit = rate x latency + burst` with a 200ms latency default.
const TBF_QUEUE_LATENCY_MS: u64 = 200;

/// The kernel's `tc_ratespec` structure.
///
/// ```c
/// struct tc_ratespec {
///     unsigned char cell_log;    /* cell size log2 */
///     __u8 linklayer;            /* link layer type */
///     unsigned short overhead;   /* link layer overhead */
///     short cell_align;          /* cell alignment */
///     unsigned short mpu;        /* minimum packet unit */
///     __u32 rate;                /* rate in bytes/sec */
/// };
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TcRateSpec {
    pub cell_log: u8,
    /// 0 = linklayer unaware: the kernel auto-detects from the rate table.
    pub linklayer: u8,
    pub overhead: u16,
    pub cell_align: i16,
    pub mpu: u16,
    /// Rate in bytes per second.
    pub rate: u32,
}

impl TcRateSpec {
    /// Rate spec for the given rate in bytes per second, with `cell_log`
    /// derived from the MTU (`mtu >> cell_log` must fit a byte).
    pub fn new(rate_bytes_per_sec: u32, mtu: u32) -> Self {
        Self {
            rate: rate_bytes_per_sec,
            linklayer: 0,
            cell_log: Self::compute_cell_log(mtu),
            cell_align: -1, // standard value from iproute2
            ..Default::default()
        }
    }

    pub fn compute_cell_log(mtu: u32) -> u8 {
        let mut cell_log = 0u8;
        while (mtu >> cell_log) > 255 {
            cell_log += 1;
        }
        cell_log
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(12);
        vec.push(self.cell_log);
        vec.push(self.linklayer);
        vec.extend_from_slice(&self.overhead.to_ne_bytes());
        vec.extend_from_slice(&self.cell_align.to_ne_bytes());
        vec.extend_from_slice(&self.mpu.to_ne_bytes());
        vec.extend_from_slice(&self.rate.to_ne_bytes());
        vec
    }
}

/// The kernel's `tc_tbf_qopt` structure, plus the burst size in bytes that
/// modern kernels additionally require as a `TCA_TBF_BURST` attribute.
///
/// ```c
/// struct tc_tbf_qopt {
///     struct tc_ratespec rate;
///     struct tc_ratespec peakrate;
///     __u32 limit;      /* max bytes in queue */
///     __u32 buffer;     /* burst size in ticks */
///     __u32 mtu;
/// };
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TbfQopt {
    pub rate: TcRateSpec,
    pub peakrate: TcRateSpec,
    pub limit: u32,
    pub buffer: u32,
    pub mtu: u32,
    pub burst_bytes: u32,
}

impl TbfQopt {
    /// Build the tbf configuration for an impairment, or `None` when the
    /// link declares no rate.
    ///
    /// The burst is sized so the bucket covers `delay + jitter` worth of
    /// traffic at the configured rate (ten MTU-sized packets at minimum):
    /// a shaped link that also delays packets must be able to absorb the
    /// delayed backlog without dropping it.
    pub fn try_from_impairment(impairment: &Impairment) -> Option<Self> {
        if impairment.rate_kbps == 0 {
            return None;
        }

        // kbit/s to bytes/s
        let rate_bytes_per_sec = impairment.rate_kbps.saturating_mul(125);

        let burst_window_ms = (impairment.delay_ms + impairment.jitter_ms) as u64;
        let windowed = (rate_bytes_per_sec as u64 * burst_window_ms / 1_000) as u32;
        let burst_bytes = windowed.max(MTU_ETHERNET * 10);

        // Burst in scheduler ticks: burst_bytes / (rate per tick), the same
        // simplification iproute2 uses.
        let tick_in_usec = *TICK_IN_USEC;
        let buffer_ticks =
            (burst_bytes as f64 * tick_in_usec * 1_000_000.0 / rate_bytes_per_sec as f64) as u32;

        let rate_bytes_per_ms = (rate_bytes_per_sec / 1_000).max(1);
        let limit = rate_bytes_per_ms
            .saturating_mul(TBF_QUEUE_LATENCY_MS as u32)
            .saturating_add(burst_bytes);

        Some(Self {
            rate: TcRateSpec::new(rate_bytes_per_sec, MTU_ETHERNET),
            peakrate: TcRateSpec::default(),
            limit,
            buffer: buffer_ticks,
            mtu: MTU_ETHERNET,
            burst_bytes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(12 + 12 + 4 + 4 + 4);
        vec.extend_from_slice(&self.rate.to_bytes());
        vec.extend_from_slice(&self.peakrate.to_bytes());
        vec.extend_from_slice(&self.limit.to_ne_bytes());
        vec.extend_from_slice(&self.buffer.to_ne_bytes());
        vec.extend_from_slice(&self.mtu.to_ne_bytes());
        vec
    }
}

/// Builder for the netlink message creating a tbf qdisc.
#[derive(Debug, Clone)]
pub struct QdiscTbfRequest {
    pub if_index: i32,
    pub parent: TcHandle,
    pub handle: TcHandle,
    pub options: TbfQopt,
}

impl QdiscTbfRequest {
    /// Create a tbf request from an [`Impairment`]. Returns `None` when no
    /// rate is configured.
    pub fn try_new(
        if_index: i32,
        parent: TcHandle,
        handle: TcHandle,
        impairment: &Impairment,
    ) -> Option<Self> {
        Some(Self { if_index, parent, handle, options: TbfQopt::try_from_impairment(impairment)? })
    }

    /// Build the netlink message.
    ///
    /// `TCA_OPTIONS` nests `TCA_TBF_PARMS` (the qopt struct), `TCA_TBF_RTAB`
    /// (the zeroed rate table) and `TCA_TBF_BURST` (burst in bytes).
    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.if_index);
        tc_message.header.parent = self.parent;
        tc_message.header.handle = self.handle;

        tc_message.attributes.push(TcAttribute::Kind("tbf".to_string()));

        let mut nlas = build_nla(TCA_TBF_PARMS, &self.options.to_bytes());
        nlas.extend(build_nla(TCA_TBF_RTAB, &DEFAULT_RATE_TABLE));
        nlas.extend(build_nla(TCA_TBF_BURST, &self.options.burst_bytes.to_ne_bytes()));
        tc_message.attributes.push(TcAttribute::Other(build_nested_options(nlas)));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(tc_message));
        nl_req.header.flags = NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK;

        tracing::debug!(?nl_req, "built tbf request");

        nl_req
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_rate_no_tbf() {
        let impairment = Impairment { rate_kbps: 0, ..Default::default() };
        assert!(TbfQopt::try_from_impairment(&impairment).is_none());
    }

    #[test]
    fn rate_conversion_is_kbit_to_bytes() {
        let impairment = Impairment { rate_kbps: 1_000, ..Default::default() };
        let qopt = TbfQopt::try_from_impairment(&impairment).unwrap();
        // 1000 kbit/s = 125_000 bytes/s
        assert_eq!(qopt.rate.rate, 125_000);
    }

    #[test]
    fn burst_covers_delay_and_jitter() {
        // 8 Mbit/s with 100ms of delay+jitter must buffer 100ms of traffic.
        let impairment =
            Impairment { rate_kbps: 8_000, delay_ms: 80, jitter_ms: 20, ..Default::default() };
        let qopt = TbfQopt::try_from_impairment(&impairment).unwrap();
        let expected = 8_000u32 * 125 / 10; // rate_bytes * 0.1s
        assert_eq!(qopt.burst_bytes, expected);
    }

    #[test]
    fn burst_floor_is_ten_packets() {
        // Tiny rate, no delay: the floor keeps the bucket usable.
        let impairment = Impairment { rate_kbps: 8, ..Default::default() };
        let qopt = TbfQopt::try_from_impairment(&impairment).unwrap();
        assert_eq!(qopt.burst_bytes, MTU_ETHERNET * 10);
    }

    #[test]
    fn cell_log_for_ethernet() {
        // 1500 >> 3 = 187 < 256
        assert_eq!(TcRateSpec::compute_cell_log(MTU_ETHERNET), 3);
    }
}
