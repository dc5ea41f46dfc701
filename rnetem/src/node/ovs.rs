//! Ovs-typed nodes.
//!
//! An `ovs` node is an L2 switch: one bridge inside the project's shared
//! Open vSwitch container. Attached interfaces become ports of that bridge.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt as _;
use rtnetlink::LinkUnspec;

use crate::error::{Error, Result};
use crate::link::bridge_device_name;
use crate::netns::NetnsHandle;
use crate::node::{NetemNode, NodeStatus};
use crate::ovs::OvsProjectInstance;

#[derive(Debug)]
struct State {
    status: NodeStatus,
    interfaces: HashMap<usize, String>,
}

#[derive(Debug)]
pub struct OvsNode {
    name: String,
    short_name: String,
    /// Bridge name inside the switch container, `ntm<prjId>.<shortName>`.
    bridge: String,
    handle: rtnetlink::Handle,
    ovs: Arc<OvsProjectInstance>,
    state: Mutex<State>,
}

impl OvsNode {
    pub fn new(
        prj_id: &str,
        name: &str,
        short_name: String,
        handle: rtnetlink::Handle,
        ovs: Arc<OvsProjectInstance>,
    ) -> Self {
        let bridge = bridge_device_name(prj_id, &short_name);
        Self {
            name: name.to_string(),
            short_name,
            bridge,
            handle,
            ovs,
            state: Mutex::new(State { status: NodeStatus::Created, interfaces: HashMap::new() }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("node state poisoned")
    }
}

#[async_trait]
impl NetemNode for OvsNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn short_name(&self) -> &str {
        &self.short_name
    }

    fn kind(&self) -> &'static str {
        "ovs"
    }

    fn status(&self) -> NodeStatus {
        self.lock().status
    }

    fn netns(&self) -> Result<NetnsHandle> {
        self.ovs.netns()
    }

    async fn start(&self) -> Result<()> {
        if self.status() == NodeStatus::Started {
            return Ok(());
        }
        self.ovs.add_bridge(&self.bridge).await?;
        self.lock().status = NodeStatus::Started;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.status() != NodeStatus::Started {
            return Ok(());
        }
        self.ovs.del_bridge(&self.bridge).await?;
        let mut state = self.lock();
        state.interfaces.clear();
        state.status = NodeStatus::Stopped;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let status = self.status();
        if status == NodeStatus::Closed {
            return Ok(());
        }
        if status == NodeStatus::Started {
            self.ovs.del_bridge(&self.bridge).await?;
        }
        let mut state = self.lock();
        state.interfaces.clear();
        state.status = NodeStatus::Closed;
        Ok(())
    }

    async fn save(&self, _config_dir: &Path) -> Result<()> {
        // The switch holds no saved state; ports are rebuilt from the
        // topology on every run.
        Ok(())
    }

    async fn load_config(&self, _config_dir: &Path) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn attach_interface(&self, if_name: &str, if_index: usize) -> Result<()> {
        let ns = self.netns()?;

        {
            let state = self.lock();
            if state.interfaces.contains_key(&if_index) {
                return Err(Error::InterfaceInUse { node: self.name.clone(), if_index });
            }
        }

        self.handle
            .link()
            .set(LinkUnspec::new_with_name(if_name).setns_by_fd(ns.fd()).build())
            .execute()
            .await?;

        let name = if_name.to_string();
        ns.enter(move |handle| {
            async move {
                handle.link().set(LinkUnspec::new_with_name(&name).up().build()).execute().await?;
                Ok(())
            }
            .boxed()
        })
        .await?;

        self.ovs.add_port(&self.bridge, if_name).await?;

        self.lock().interfaces.insert(if_index, if_name.to_string());
        Ok(())
    }
}
