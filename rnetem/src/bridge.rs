//! Host bridges.
//!
//! A bridge is a kernel bridge device in the root namespace, optionally
//! enslaving a host NIC, wired to member nodes through veth legs whose
//! root side is enslaved to the bridge and whose peer side lives in the
//! member's namespace.
//!
//! [`BridgeNode`] is the external node variant standing for the bridge
//! itself: not a container, its namespace is the root namespace, and closing
//! it deletes the device.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rtnetlink::{LinkBridge, LinkUnspec, LinkVeth};

use crate::error::{Error, Result};
use crate::link::{bridge_device_name, bridge_peer_leg_name, if_nametoindex};
use crate::netns::NetnsHandle;
use crate::node::{NetemNode, NodeStatus};

#[derive(Debug)]
struct State {
    status: NodeStatus,
    device_created: bool,
    /// Root-side names of enslaved interfaces, including the host NIC.
    interfaces: Vec<String>,
}

/// The external host-bridge endpoint node.
#[derive(Debug)]
pub struct BridgeNode {
    name: String,
    short_name: String,
    /// Kernel device name, `ntm<prjId>.<shortName>`.
    device: String,
    handle: rtnetlink::Handle,
    root_ns: NetnsHandle,
    state: Mutex<State>,
}

impl BridgeNode {
    pub fn new(
        prj_id: &str,
        name: &str,
        short_name: String,
        handle: rtnetlink::Handle,
        root_ns: NetnsHandle,
    ) -> Self {
        let device = bridge_device_name(prj_id, &short_name);
        Self {
            name: name.to_string(),
            short_name,
            device,
            handle,
            root_ns,
            state: Mutex::new(State {
                status: NodeStatus::Created,
                device_created: false,
                interfaces: Vec::new(),
            }),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("bridge state poisoned")
    }

    /// Create the kernel bridge device, administratively up.
    async fn create_device(&self) -> Result<()> {
        self.handle
            .link()
            .add(LinkBridge::new(&self.device).up().build())
            .execute()
            .await
            .map_err(Error::context("create", "bridge device", self.device.clone()))?;
        self.lock().device_created = true;
        Ok(())
    }

    /// Enslave the configured host NIC. The NIC must already exist in the
    /// root namespace.
    async fn attach_host_interface(&self, host_if: &str) -> Result<()> {
        if if_nametoindex(host_if).is_none() {
            return Err(Error::HostInterfaceNotFound(host_if.to_string()));
        }
        self.enslave(host_if).await
    }

    async fn enslave(&self, if_name: &str) -> Result<()> {
        let bridge_index = if_nametoindex(&self.device)
            .ok_or_else(|| Error::InterfaceNotFound(self.device.clone()))?
            .get();

        self.handle
            .link()
            .set(LinkUnspec::new_with_name(if_name).controller(bridge_index).up().build())
            .execute()
            .await?;

        self.lock().interfaces.push(if_name.to_string());
        Ok(())
    }
}

#[async_trait]
impl NetemNode for BridgeNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn short_name(&self) -> &str {
        &self.short_name
    }

    fn kind(&self) -> &'static str {
        "bridge"
    }

    fn status(&self) -> NodeStatus {
        self.lock().status
    }

    fn netns(&self) -> Result<NetnsHandle> {
        Ok(self.root_ns.clone())
    }

    async fn start(&self) -> Result<()> {
        self.lock().status = NodeStatus::Started;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.lock().status = NodeStatus::Stopped;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let created = {
            let state = self.lock();
            state.status != NodeStatus::Closed && state.device_created
        };

        if created {
            if let Some(index) = if_nametoindex(&self.device) {
                self.handle.link().del(index.get()).execute().await?;
            }
        }

        let mut state = self.lock();
        state.device_created = false;
        state.interfaces.clear();
        state.status = NodeStatus::Closed;
        Ok(())
    }

    async fn save(&self, _config_dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn load_config(&self, _config_dir: &Path) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Enslave a root-namespace interface to this bridge. Used for the root
    /// side of member legs; the peer side belongs to the member node.
    async fn attach_interface(&self, if_name: &str, _if_index: usize) -> Result<()> {
        self.enslave(if_name).await
    }
}

/// One member leg of a bridge.
#[derive(Debug, Clone)]
pub struct BridgeLeg {
    pub node: Arc<dyn NetemNode>,
    pub if_index: usize,
    /// Root-side veth name; enough to delete the pair at teardown.
    pub root_if_name: String,
}

/// A runtime bridge: the device node, the optional host NIC, the legs.
#[derive(Debug, Clone)]
pub struct NetemBridge {
    pub node: Arc<BridgeNode>,
    pub host: Option<String>,
    pub legs: Vec<BridgeLeg>,
}

impl NetemBridge {
    pub fn new(node: Arc<BridgeNode>, host: Option<String>) -> Self {
        Self { node, host, legs: Vec::new() }
    }
}

/// Build a bridge: device, host NIC, then every member leg in order.
///
/// Legs are serial within one bridge; distinct bridges may build in
/// parallel because their names never overlap.
pub async fn build_bridge(handle: &rtnetlink::Handle, prj_id: &str, bridge: &NetemBridge) -> Result<()> {
    tracing::debug!(bridge = %bridge.node.name(), device = %bridge.node.device(), "building bridge");

    bridge.node.create_device().await?;

    if let Some(host_if) = &bridge.host {
        bridge
            .node
            .attach_host_interface(host_if)
            .await
            .map_err(Error::context("attach", "host interface to bridge", bridge.node.name()))?;
    }

    for leg in &bridge.legs {
        let peer_if = bridge_peer_leg_name(prj_id, leg.if_index, leg.node.short_name());

        handle
            .link()
            .add(LinkVeth::new(&leg.root_if_name, &peer_if).build())
            .execute()
            .await
            .map_err(Error::context("create", "veth leg of bridge", bridge.node.name()))?;

        leg.node
            .attach_interface(&peer_if, leg.if_index)
            .await
            .map_err(Error::context("attach", "interface to node", leg.node.name()))?;

        bridge
            .node
            .attach_interface(&leg.root_if_name, leg.if_index)
            .await
            .map_err(Error::context("enslave", "leg to bridge", bridge.node.name()))?;
    }

    Ok(())
}

/// Dismantle a bridge: the device first, then every root-side leg.
///
/// Best-effort by contract; failures are logged and never propagated, so a
/// half-built bridge never blocks `Close`. Deleting the root side of a leg
/// destroys the pair even when the peer namespace is already gone.
pub async fn teardown_bridge(bridge: &NetemBridge) {
    if let Err(e) = bridge.node.close().await {
        tracing::error!(bridge = %bridge.node.name(), error = %e, "error when deleting bridge device");
    }

    for leg in &bridge.legs {
        let Some(index) = if_nametoindex(&leg.root_if_name) else { continue };
        if let Err(e) = bridge.node.handle.link().del(index.get()).execute().await {
            tracing::error!(
                bridge = %bridge.node.name(),
                leg = %leg.root_if_name,
                error = %e,
                "error when deleting bridge leg"
            );
        }
    }
}
