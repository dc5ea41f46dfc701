//! Docker-backed nodes (routers and hosts).
//!
//! One container per node, created without any docker networking: every
//! interface the node ever sees is a veth leg the daemon moves in. The
//! container images ship a `netem-config` helper that exports and applies
//! the node's saved state; its output lines are the node's diagnostics.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::FutureExt as _;
use rtnetlink::{LinkUnspec, LinkVrf};

use crate::docker;
use crate::error::{Error, Result};
use crate::netns::NetnsHandle;
use crate::node::{NetemNode, NodeStatus};
use crate::topology::{NodeKind, TopologyNode};
use crate::NETEM_ID;

/// In-container scratch path used to shuttle saved configs.
const CONFIG_SHUTTLE_PATH: &str = "/tmp/rnetem.conf";

/// Routing table offset for VRF devices created inside the node.
const VRF_TABLE_BASE: u32 = 10;

#[derive(Debug)]
struct State {
    status: NodeStatus,
    netns: Option<NetnsHandle>,
    /// Attached interfaces, keyed by interface index.
    interfaces: HashMap<usize, String>,
}

/// A router or host realized as a docker container.
#[derive(Debug)]
pub struct DockerNode {
    name: String,
    short_name: String,
    kind: NodeKind,
    /// Container name, `ntm<prjId>.<nodeName>`.
    container: String,
    ipv6: bool,
    mpls: bool,
    vrfs: Vec<String>,
    handle: rtnetlink::Handle,
    state: Mutex<State>,
}

impl DockerNode {
    /// Create the container for a topology entry. The container is not
    /// started; that happens in `start`.
    pub async fn create(
        prj_id: &str,
        spec: &TopologyNode,
        short_name: String,
        image: String,
        handle: rtnetlink::Handle,
    ) -> Result<std::sync::Arc<Self>> {
        let container = format!("{NETEM_ID}{prj_id}.{}", spec.name);

        let mut env = Vec::new();
        if !spec.config.vrrps.is_empty() {
            env.push(format!("NTM_VRRPS={}", spec.config.vrrps.join(",")));
        }

        docker::create(&image, &container, &spec.name, &spec.config.volumes, &env)
            .await
            .map_err(Error::context("create", "container of node", &spec.name))?;

        Ok(std::sync::Arc::new(Self {
            name: spec.name.clone(),
            short_name,
            kind: spec.kind,
            container,
            ipv6: spec.config.ipv6,
            mpls: spec.config.mpls,
            vrfs: spec.config.vrfs.clone(),
            handle,
            state: Mutex::new(State {
                status: NodeStatus::Created,
                netns: None,
                interfaces: HashMap::new(),
            }),
        }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("node state poisoned")
    }

    /// Apply the per-node sysctls the topology asks for. The container runs
    /// privileged, so `sysctl -w` inside it reaches its own namespaces.
    async fn apply_sysctls(&self) -> Result<()> {
        if self.ipv6 {
            docker::exec(&self.container, ["sysctl", "-w", "net.ipv6.conf.all.disable_ipv6=0"])
                .await?;
            if self.kind == NodeKind::Router {
                docker::exec(&self.container, ["sysctl", "-w", "net.ipv6.conf.all.forwarding=1"])
                    .await?;
            }
        }
        if self.mpls {
            docker::exec(&self.container, ["sysctl", "-w", "net.mpls.platform_labels=1048575"])
                .await?;
        }
        Ok(())
    }

    /// Create one VRF device per declared VRF inside the node's namespace.
    async fn create_vrfs(&self, ns: &NetnsHandle) -> Result<()> {
        for (index, vrf) in self.vrfs.iter().enumerate() {
            let name = vrf.clone();
            let table = VRF_TABLE_BASE + index as u32;
            ns.enter(move |handle| {
                async move {
                    handle.link().add(LinkVrf::new(&name, table).up().build()).execute().await?;
                    Ok(())
                }
                .boxed()
            })
            .await?;
        }
        Ok(())
    }

    fn saved_config_path(&self, config_dir: &Path) -> std::path::PathBuf {
        config_dir.join(format!("{}.conf", self.name))
    }
}

#[async_trait]
impl NetemNode for DockerNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn short_name(&self) -> &str {
        &self.short_name
    }

    fn kind(&self) -> &'static str {
        "docker"
    }

    fn status(&self) -> NodeStatus {
        self.lock().status
    }

    fn netns(&self) -> Result<NetnsHandle> {
        self.lock().netns.clone().ok_or_else(|| Error::NodeNotRunning(self.name.clone()))
    }

    async fn start(&self) -> Result<()> {
        if self.status() == NodeStatus::Started {
            return Ok(());
        }

        docker::start(&self.container).await?;
        let pid = docker::pid(&self.container).await?;
        let ns = NetnsHandle::from_pid(pid)?;

        self.apply_sysctls().await?;
        self.create_vrfs(&ns).await?;

        let mut state = self.lock();
        state.netns = Some(ns);
        state.status = NodeStatus::Started;

        tracing::debug!(node = %self.name, container = %self.container, pid, "node started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.status() != NodeStatus::Started {
            return Ok(());
        }

        docker::stop(&self.container).await?;

        // The namespace dies with the container, and every veth in it.
        let mut state = self.lock();
        state.netns = None;
        state.interfaces.clear();
        state.status = NodeStatus::Stopped;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.status() == NodeStatus::Closed {
            return Ok(());
        }

        docker::remove(&self.container).await?;

        let mut state = self.lock();
        state.netns = None;
        state.interfaces.clear();
        state.status = NodeStatus::Closed;
        Ok(())
    }

    async fn save(&self, config_dir: &Path) -> Result<()> {
        if self.status() != NodeStatus::Started {
            tracing::debug!(node = %self.name, "not running, nothing to save");
            return Ok(());
        }

        docker::exec(&self.container, ["netem-config", "save", CONFIG_SHUTTLE_PATH]).await?;
        docker::cp_from(&self.container, CONFIG_SHUTTLE_PATH, &self.saved_config_path(config_dir))
            .await?;
        Ok(())
    }

    async fn load_config(&self, config_dir: &Path) -> Result<Vec<String>> {
        if self.status() != NodeStatus::Started {
            return Err(Error::NodeNotRunning(self.name.clone()));
        }

        let saved = self.saved_config_path(config_dir);
        if !saved.exists() {
            return Ok(Vec::new());
        }

        docker::cp_to(&saved, &self.container, CONFIG_SHUTTLE_PATH).await?;
        let output =
            docker::exec(&self.container, ["netem-config", "load", CONFIG_SHUTTLE_PATH]).await?;

        let messages = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        Ok(messages)
    }

    async fn attach_interface(&self, if_name: &str, if_index: usize) -> Result<()> {
        let ns = self.netns()?;

        {
            let state = self.lock();
            if state.interfaces.contains_key(&if_index) {
                return Err(Error::InterfaceInUse { node: self.name.clone(), if_index });
            }
        }

        // Move the device out of the root namespace, then bring it up from
        // inside: once moved, the root handle no longer sees it.
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

        self.lock().interfaces.insert(if_index, if_name.to_string());
        Ok(())
    }

    fn supports_copy(&self) -> bool {
        true
    }

    async fn copy_from(&self, source: &str, dest: &Path) -> Result<()> {
        docker::cp_from(&self.container, source, dest).await?;
        Ok(())
    }

    async fn copy_to(&self, source: &Path, dest: &str) -> Result<()> {
        docker::cp_to(source, &self.container, dest).await?;
        Ok(())
    }
}
