//! Qdisc installation against an [`rtnetlink::Handle`].
//!
//! The handle must come from a connection opened inside the namespace that
//! owns the interface; qdiscs are always installed where the device lives.

use futures::StreamExt as _;
use rtnetlink::packet_core::NetlinkPayload;
use rtnetlink::packet_route::tc::TcHandle;

use crate::netem::{NetemQopt, QdiscNetemRequest};
use crate::tbf::QdiscTbfRequest;

/// Handle of the netem root qdisc (`1:0`).
const NETEM_HANDLE: u32 = 0x0001_0000;
/// Netem's single implicit class (`1:1`), the attach point for tbf.
const NETEM_CLASS: u32 = 0x0001_0001;
/// Handle of the tbf qdisc (`10:0`).
const TBF_HANDLE: u32 = 0x000A_0000;

/// Impairment parameters of one link, as declared in the topology document.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Impairment {
    /// Fixed one-way delay in milliseconds.
    pub delay_ms: u32,
    /// Random delay variation in milliseconds.
    pub jitter_ms: u32,
    /// Random loss in percent (0-100).
    pub loss: f64,
    /// Shaped rate in kbit/s; 0 means unshaped.
    pub rate_kbps: u32,
}

impl Impairment {
    /// Whether a netem qdisc is needed: a delay or a loss is declared.
    pub fn wants_netem(&self) -> bool {
        self.delay_ms > 0 || self.loss > 0.0
    }

    /// Whether a tbf qdisc is needed.
    pub fn wants_rate(&self) -> bool {
        self.rate_kbps > 0
    }

    /// Whether the link carries no impairment at all.
    pub fn is_transparent(&self) -> bool {
        !self.wants_netem() && !self.wants_rate() && self.jitter_ms == 0
    }
}

/// Install the qdisc chain for `impairment` on the interface `if_index`.
///
/// Netem (when wanted) goes at the root; tbf (when wanted) under it, or at
/// the root itself when the link only declares a rate. A transparent
/// impairment installs nothing.
pub async fn install_impairments(
    handle: &mut rtnetlink::Handle,
    if_index: i32,
    impairment: &Impairment,
) -> Result<(), rtnetlink::Error> {
    if impairment.wants_netem() {
        tracing::debug!(
            if_index,
            delay_ms = impairment.delay_ms,
            jitter_ms = impairment.jitter_ms,
            loss_pct = impairment.loss,
            "installing netem qdisc"
        );

        let request = QdiscNetemRequest::new(
            if_index,
            TcHandle::from(NETEM_HANDLE),
            NetemQopt::from(impairment),
        )
        .build();

        let mut res = handle.request(request)?;
        while let Some(msg) = res.next().await {
            if let NetlinkPayload::Error(e) = msg.payload {
                tracing::debug!(?e, "failed to create netem qdisc");
                return Err(rtnetlink::Error::NetlinkError(e));
            }
        }
    }

    if impairment.wants_rate() {
        let parent = if impairment.wants_netem() {
            TcHandle::from(NETEM_CLASS)
        } else {
            TcHandle::ROOT
        };

        tracing::debug!(
            if_index,
            rate_kbps = impairment.rate_kbps,
            ?parent,
            "installing tbf qdisc"
        );

        let request = QdiscTbfRequest::try_new(
            if_index,
            parent,
            TcHandle::from(TBF_HANDLE),
            impairment,
        )
        .expect("rate is non-zero")
        .build();

        let mut res = handle.request(request)?;
        while let Some(msg) = res.next().await {
            if let NetlinkPayload::Error(e) = msg.payload {
                tracing::debug!(?e, "failed to create tbf qdisc");
                return Err(rtnetlink::Error::NetlinkError(e));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transparent_links_install_nothing() {
        assert!(Impairment::default().is_transparent());
        assert!(!Impairment { delay_ms: 1, ..Default::default() }.is_transparent());
        assert!(!Impairment { loss: 0.1, ..Default::default() }.is_transparent());
        assert!(!Impairment { rate_kbps: 64, ..Default::default() }.is_transparent());
    }

    #[test]
    fn netem_wanted_on_delay_or_loss() {
        assert!(Impairment { delay_ms: 50, ..Default::default() }.wants_netem());
        assert!(Impairment { loss: 1.5, ..Default::default() }.wants_netem());
        // jitter alone does not trigger netem
        assert!(!Impairment { jitter_ms: 5, ..Default::default() }.wants_netem());
    }
}
