//! Point-to-point link construction and interface naming.
//!
//! Links are veth pairs created in the root namespace, one end then moved
//! into each peer's namespace by the owning node, with the link's qdiscs
//! installed on both ends from inside those namespaces.
//!
//! Naming is load-bearing: every generated kernel name embeds the project id
//! and the node's short id, which keeps names unique across all active
//! projects and identifiable from the host (`ip link` output reads as
//! `<prjId><node>.<ifIndex>`).

use std::ffi::CString;
use std::num::NonZeroU32;
use std::sync::Arc;

use futures::FutureExt as _;
use rtnetlink::LinkVeth;

use rnetem_tc::{install_impairments, Impairment};

use crate::error::{Error, Result};
use crate::node::NetemNode;
use crate::NETEM_ID;

/// Interface index from a name, in the namespace of the calling thread.
pub(crate) fn if_nametoindex(name: &str) -> Option<NonZeroU32> {
    let Ok(name) = CString::new(name) else { return None };
    let index = unsafe { nix::libc::if_nametoindex(name.as_ptr()) };
    NonZeroU32::new(index)
}

/// Name of a point-to-point link leg: `<prjId><shortName>.<ifIndex>`.
pub fn p2p_if_name(prj_id: &str, short_name: &str, if_index: usize) -> String {
    format!("{prj_id}{short_name}.{if_index}")
}

/// Root-side name of a host-bridge leg: `ntm<prjId><shortName>.<ifIndex>`.
pub fn bridge_root_leg_name(prj_id: &str, short_name: &str, if_index: usize) -> String {
    format!("{NETEM_ID}{prj_id}{short_name}.{if_index}")
}

/// Peer-side name of a host-bridge leg: `ntm<prjId><ifIndex>.<shortName>`.
pub fn bridge_peer_leg_name(prj_id: &str, if_index: usize, short_name: &str) -> String {
    format!("{NETEM_ID}{prj_id}{if_index}.{short_name}")
}

/// Kernel bridge (or ovs bridge) device name: `ntm<prjId>.<shortName>`.
pub fn bridge_device_name(prj_id: &str, short_name: &str) -> String {
    format!("{NETEM_ID}{prj_id}.{short_name}")
}

/// One endpoint of a runtime link.
#[derive(Debug, Clone)]
pub struct LinkPeer {
    pub node: Arc<dyn NetemNode>,
    pub if_index: usize,
}

/// A runtime link: an unordered pair of endpoints plus impairments.
///
/// The link does not own its endpoints (the manager's node list does); the
/// veth pair it creates is owned by the two nodes it wires.
#[derive(Debug, Clone)]
pub struct NetemLink {
    pub peer1: LinkPeer,
    pub peer2: LinkPeer,
    pub impairment: Impairment,
}

/// Create the veth pair for a link, hand each end to its peer and install
/// the qdisc chain on both ends.
///
/// Link construction is serial by design (the manager never calls this
/// concurrently): parallel veth creation and namespace moves race in the
/// kernel over transient name visibility.
pub async fn build_link(handle: &rtnetlink::Handle, prj_id: &str, link: &NetemLink) -> Result<()> {
    let if1 = p2p_if_name(prj_id, link.peer1.node.short_name(), link.peer1.if_index);
    let if2 = p2p_if_name(prj_id, link.peer2.node.short_name(), link.peer2.if_index);

    tracing::debug!(
        peer1 = %link.peer1.node.name(),
        peer2 = %link.peer2.node.name(),
        %if1,
        %if2,
        "building link"
    );

    handle
        .link()
        .add(LinkVeth::new(&if1, &if2).build())
        .execute()
        .await
        .map_err(Error::context("create", "veth pair of link", format!("{if1} <-> {if2}")))?;

    link.peer1
        .node
        .attach_interface(&if1, link.peer1.if_index)
        .await
        .map_err(Error::context("attach", "interface to node", link.peer1.node.name()))?;
    link.peer2
        .node
        .attach_interface(&if2, link.peer2.if_index)
        .await
        .map_err(Error::context("attach", "interface to node", link.peer2.node.name()))?;

    if link.impairment.is_transparent() {
        return Ok(());
    }

    for (peer, if_name) in [(&link.peer1, &if1), (&link.peer2, &if2)] {
        let ns = peer.node.netns()?;
        let name = if_name.clone();
        let impairment = link.impairment;

        ns.enter(move |mut handle| {
            async move {
                let index = if_nametoindex(&name)
                    .ok_or_else(|| Error::InterfaceNotFound(name.clone()))?
                    .get() as i32;
                install_impairments(&mut handle, index, &impairment).await?;
                Ok(())
            }
            .boxed()
        })
        .await
        .map_err(Error::context("set impairments of", "interface", if_name.clone()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2p_names_embed_project_and_short_id() {
        assert_eq!(p2p_if_name("a1b2", "r1", 0), "a1b2r1.0");
        assert_eq!(p2p_if_name("a1b2", "er", 12), "a1b2er.12");
    }

    #[test]
    fn bridge_names_carry_the_netem_prefix() {
        assert_eq!(bridge_root_leg_name("a1b2", "h1", 0), "ntma1b2h1.0");
        assert_eq!(bridge_peer_leg_name("a1b2", 0, "h1"), "ntma1b20.h1");
        assert_eq!(bridge_device_name("a1b2", "br"), "ntma1b2.br");
    }

    #[test]
    fn generated_names_are_pairwise_distinct() {
        // One node's p2p leg, bridge legs and a bridge device for the same
        // short id and index never collide with each other.
        let names = [
            p2p_if_name("p", "h1", 0),
            bridge_root_leg_name("p", "h1", 0),
            bridge_peer_leg_name("p", 0, "h1"),
            bridge_device_name("p", "h1"),
        ];
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len(), "{names:?}");
    }
}
