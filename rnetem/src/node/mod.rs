//! Node abstraction.
//!
//! A node is one emulated router, host or switch. The manager only speaks
//! [`NetemNode`]; the variants differ in what backs them (a docker container,
//! a bridge inside the project's Open vSwitch container, or a kernel bridge
//! device for host-bridge endpoints).

mod docker;
mod ovs;

pub use docker::DockerNode;
pub use ovs::OvsNode;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::netns::NetnsHandle;
use crate::ovs::OvsProjectInstance;
use crate::topology::{NodeKind, TopologyNode};

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Created,
    Started,
    Stopped,
    Closed,
}

/// The capability set the manager drives nodes through.
///
/// Every method returns a typed error except `load_config`, which also
/// returns per-node diagnostic messages (empty on success). `netns` hands
/// out a refcounted handle; concurrent holders are fine and release is drop.
#[async_trait]
pub trait NetemNode: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn short_name(&self) -> &str;
    /// Backing variant tag: `docker`, `ovs` or `bridge`.
    fn kind(&self) -> &'static str;
    fn status(&self) -> NodeStatus;
    fn netns(&self) -> Result<NetnsHandle>;

    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    async fn save(&self, config_dir: &Path) -> Result<()>;
    async fn load_config(&self, config_dir: &Path) -> Result<Vec<String>>;

    /// Take ownership of a root-namespace interface: move it into the node's
    /// namespace, bring it up and record it under `if_index`.
    async fn attach_interface(&self, if_name: &str, if_index: usize) -> Result<()>;

    /// Whether the file-copy operations are available on this variant.
    fn supports_copy(&self) -> bool {
        false
    }

    async fn copy_from(&self, _source: &str, _dest: &Path) -> Result<()> {
        Err(Error::CopyUnsupported(self.name().to_string()))
    }

    async fn copy_to(&self, _source: &Path, _dest: &str) -> Result<()> {
        Err(Error::CopyUnsupported(self.name().to_string()))
    }
}

/// Build the node variant for a topology entry.
///
/// Docker-backed variants create their container here (and may fail);
/// ovs-backed nodes only register against the project's switch instance.
pub async fn create_node(
    prj_id: &str,
    spec: &TopologyNode,
    short_name: String,
    image: String,
    handle: rtnetlink::Handle,
    ovs: Arc<OvsProjectInstance>,
) -> Result<Arc<dyn NetemNode>> {
    let node: Arc<dyn NetemNode> = match spec.kind {
        NodeKind::Router | NodeKind::Host => {
            DockerNode::create(prj_id, spec, short_name, image, handle).await?
        }
        NodeKind::Ovs => Arc::new(OvsNode::new(prj_id, &spec.name, short_name, handle, ovs)),
    };
    Ok(node)
}
