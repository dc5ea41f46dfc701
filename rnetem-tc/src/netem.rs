//! Netem qdisc requests.
//!
//! Netem injects delay, jitter and random loss. The daemon installs it as the
//! root qdisc of a link leg whenever the link declares a delay or a loss.

use nix::libc::TCA_OPTIONS;
use rtnetlink::packet_core::{
    NetlinkMessage, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST,
};
use rtnetlink::packet_utils::nla::DefaultNla;
use rtnetlink::packet_route::{
    tc::{TcAttribute, TcHandle, TcMessage},
    RouteNetlinkMessage,
};

use crate::core::usec_to_ticks;
use crate::qdisc::Impairment;

/// Packets queued in netem before drops; matches the qdisc's own default.
const NETEM_LIMIT: u32 = 1_000;

/// The kernel's `tc_netem_qopt` structure.
///
/// Field order must match `<linux/pkt_sched.h>`:
///
/// ```c
/// struct tc_netem_qopt {
///     __u32 latency;    /* delay in scheduler ticks */
///     __u32 limit;      /* queue size limit in packets */
///     __u32 loss;       /* loss probability (0 to 2^32-1) */
///     __u32 gap;        /* reordering gap */
///     __u32 duplicate;  /* duplication probability */
///     __u32 jitter;     /* jitter in scheduler ticks */
/// };
/// ```
#[derive(Debug, Clone, Copy)]
pub struct NetemQopt {
    pub latency: u32,
    pub limit: u32,
    pub loss: u32,
    pub gap: u32,
    pub duplicate: u32,
    pub jitter: u32,
}

impl NetemQopt {
    /// Convert a percentage (0-100) to the kernel's probability encoding,
    /// where [`u32::MAX`] is 100%.
    pub fn u32_probability(percent: f64) -> u32 {
        (percent / 100.0 * u32::MAX as f64) as u32
    }

    /// Serialize in native endian, as the kernel expects for structs passed
    /// over netlink.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(4 * 6);
        vec.extend_from_slice(&self.latency.to_ne_bytes());
        vec.extend_from_slice(&self.limit.to_ne_bytes());
        vec.extend_from_slice(&self.loss.to_ne_bytes());
        vec.extend_from_slice(&self.gap.to_ne_bytes());
        vec.extend_from_slice(&self.duplicate.to_ne_bytes());
        vec.extend_from_slice(&self.jitter.to_ne_bytes());
        vec
    }
}

impl From<&Impairment> for NetemQopt {
    fn from(value: &Impairment) -> Self {
        Self {
            latency: usec_to_ticks(value.delay_ms.saturating_mul(1_000)),
            limit: NETEM_LIMIT,
            loss: Self::u32_probability(value.loss),
            gap: 0,
            duplicate: 0,
            jitter: usec_to_ticks(value.jitter_ms.saturating_mul(1_000)),
        }
    }
}

/// Builder for the netlink message creating a netem root qdisc.
#[derive(Debug)]
pub struct QdiscNetemRequest {
    pub if_index: i32,
    pub handle: TcHandle,
    pub options: NetemQopt,
}

impl QdiscNetemRequest {
    pub fn new(if_index: i32, handle: TcHandle, options: NetemQopt) -> Self {
        Self { if_index, handle, options }
    }

    /// Build the netlink message. The qdisc attaches at the interface root.
    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.if_index);
        tc_message.header.parent = TcHandle::ROOT;
        tc_message.header.handle = self.handle;

        tc_message.attributes.push(TcAttribute::Kind("netem".to_string()));
        tc_message
            .attributes
            .push(TcAttribute::Other(DefaultNla::new(TCA_OPTIONS, self.options.to_bytes())));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(tc_message));
        nl_req.header.flags = NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probability_scaling() {
        assert_eq!(NetemQopt::u32_probability(0.0), 0);
        assert_eq!(NetemQopt::u32_probability(100.0), u32::MAX);

        // 50% is half the range, within rounding
        let half = NetemQopt::u32_probability(50.0);
        assert!((half as i64 - (u32::MAX / 2) as i64).abs() < 2);
    }

    #[test]
    fn qopt_layout_is_six_words() {
        let qopt =
            NetemQopt { latency: 1, limit: 2, loss: 3, gap: 4, duplicate: 5, jitter: 6 };
        let bytes = qopt.to_bytes();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[0..4], &1u32.to_ne_bytes());
        assert_eq!(&bytes[20..24], &6u32.to_ne_bytes());
    }
}
