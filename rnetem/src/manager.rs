//! The topology manager.
//!
//! Owns a project's lifecycle: `Load` materializes the document into
//! containers and an OVS instance, `Run` starts everything and wires the
//! dataplane, `Close` tears the whole scene down. Concurrency follows the
//! safety of each stage: node lifecycle calls fan out onto tasks, link
//! construction stays serial, teardown always runs to completion.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;

use crate::bridge::{self, BridgeLeg, BridgeNode, NetemBridge};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::idgen::IdGenerator;
use crate::link::{self, bridge_root_leg_name, LinkPeer, NetemLink};
use crate::netns::NetnsHandle;
use crate::node::{self, NetemNode};
use crate::ovs::OvsProjectInstance;
use crate::topology::{NodeKind, TopologyFile};

/// Name of the topology document inside a project directory.
pub const NETWORK_FILENAME: &str = "network.yml";
/// Directory of per-node saved configs inside a project directory.
pub const CONFIG_DIR: &str = "configs";

/// Diagnostics one node produced while loading its config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMessages {
    pub name: String,
    pub messages: Vec<String>,
}

/// Lifecycle owner of one emulated network project.
pub struct TopologyManager {
    prj_id: String,
    path: PathBuf,
    config: Config,

    handle: rtnetlink::Handle,
    _conn_task: tokio::task::JoinHandle<()>,
    root_ns: NetnsHandle,

    id_gen: Arc<IdGenerator>,
    nodes: Vec<Arc<dyn NetemNode>>,
    links: Vec<NetemLink>,
    bridges: Vec<NetemBridge>,
    ovs: Option<Arc<OvsProjectInstance>>,
    running: bool,
}

impl TopologyManager {
    /// Create a manager for a project directory. Must be called from within
    /// a tokio runtime: the rtnetlink connection task is spawned here.
    pub fn new(
        prj_id: impl Into<String>,
        path: impl Into<PathBuf>,
        config: Config,
    ) -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(connection);

        Ok(Self {
            prj_id: prj_id.into(),
            path: path.into(),
            config,
            handle,
            _conn_task: conn_task,
            root_ns: NetnsHandle::current()?,
            id_gen: Arc::new(IdGenerator::new()),
            nodes: Vec::new(),
            links: Vec::new(),
            bridges: Vec::new(),
            ovs: None,
            running: false,
        })
    }

    pub fn network_file_path(&self) -> PathBuf {
        self.path.join(NETWORK_FILENAME)
    }

    fn config_dir(&self) -> PathBuf {
        self.path.join(CONFIG_DIR)
    }

    /// Validate the topology document without touching anything.
    pub fn check(&self) -> Result<()> {
        let file = TopologyFile::read(&self.network_file_path()).map_err(Error::Validation)?;
        let errors = file.check();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }

    /// Load the topology: validate the document, create the project's OVS
    /// instance, create every node concurrently, then resolve links and
    /// bridges into the runtime graph.
    ///
    /// On error the partial resources stay registered in the manager; the
    /// caller's next move is [`close`](Self::close).
    pub async fn load(&mut self) -> Result<()> {
        let file = TopologyFile::read(&self.network_file_path()).map_err(Error::Validation)?;
        let topology = file.validate().map_err(Error::Validation)?;

        let ovs = OvsProjectInstance::create(&self.prj_id, self.config.image_for(NodeKind::Ovs))
            .await
            .map_err(Error::context("create", "ovs instance of project", self.prj_id.clone()))?;
        self.ovs = Some(ovs.clone());

        // One pre-sized result slot per creation task: each task writes its
        // own index, nothing contends on the node list itself.
        let mut set: JoinSet<(usize, Result<Arc<dyn NetemNode>>)> = JoinSet::new();
        for (index, spec) in topology.nodes.iter().enumerate() {
            let short_name = self.id_gen.get_id(&spec.name);
            let image = spec
                .config
                .image
                .clone()
                .unwrap_or_else(|| self.config.image_for(spec.kind).to_string());

            let prj_id = self.prj_id.clone();
            let spec = spec.clone();
            let handle = self.handle.clone();
            let ovs = ovs.clone();

            tracing::debug!(project = %prj_id, node = %spec.name, "creating node");
            set.spawn(async move {
                let node =
                    node::create_node(&prj_id, &spec, short_name, image, handle, ovs).await;
                (index, node)
            });
        }

        let node_count = topology.nodes.len();
        let mut slots: Vec<Option<Arc<dyn NetemNode>>> = (0..node_count).map(|_| None).collect();
        let mut errors: Vec<(usize, String)> = Vec::new();

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(created))) => slots[index] = Some(created),
                Ok((index, Err(e))) => errors.push((index, e.to_string())),
                Err(e) => errors.push((node_count, format!("node creation task failed: {e}"))),
            }
        }

        self.nodes = slots.into_iter().flatten().collect();

        if !errors.is_empty() {
            errors.sort_by_key(|(index, _)| *index);
            return Err(Error::LoadErrors(errors.into_iter().map(|(_, e)| e).collect()));
        }

        for link in &topology.links {
            // Validation guarantees both endpoints name created nodes.
            let peer1 = self.require_node(&link.peer1.node)?;
            let peer2 = self.require_node(&link.peer2.node)?;
            self.links.push(NetemLink {
                peer1: LinkPeer { node: peer1, if_index: link.peer1.if_index },
                peer2: LinkPeer { node: peer2, if_index: link.peer2.if_index },
                impairment: link.impairment,
            });
        }

        for spec in &topology.bridges {
            let short_name = self.id_gen.get_id(&spec.name);
            let node = Arc::new(BridgeNode::new(
                &self.prj_id,
                &spec.name,
                short_name,
                self.handle.clone(),
                self.root_ns.clone(),
            ));

            let mut runtime_bridge = NetemBridge::new(node, spec.host.clone());
            for leg in &spec.legs {
                let member = self.require_node(&leg.node)?;
                let root_if_name =
                    bridge_root_leg_name(&self.prj_id, member.short_name(), leg.if_index);
                runtime_bridge.legs.push(BridgeLeg {
                    node: member,
                    if_index: leg.if_index,
                    root_if_name,
                });
            }
            self.bridges.push(runtime_bridge);
        }

        Ok(())
    }

    /// Run the topology. Five stages, in order: start the OVS instance,
    /// start every node concurrently, build links serially, build bridges
    /// concurrently, load per-node configs concurrently.
    ///
    /// Returns the per-node diagnostic messages from the config stage. On a
    /// running manager this is a warning and a no-op.
    pub async fn run(&mut self) -> Result<Vec<NodeMessages>> {
        if self.running {
            tracing::warn!(project = %self.prj_id, "topology is already running");
            return Ok(Vec::new());
        }

        let ovs = self.ovs.clone().ok_or(Error::NotLoaded)?;
        ovs.start()
            .await
            .map_err(Error::context("start", "ovs instance of project", self.prj_id.clone()))?;

        let mut set: JoinSet<Result<()>> = JoinSet::new();
        for node in &self.nodes {
            let node = node.clone();
            set.spawn(async move {
                let name = node.name().to_string();
                node.start().await.map_err(Error::context("start", "node", name))
            });
        }
        join_first_error(&mut set).await?;

        // Veth creation and namespace moves race when parallelised; links
        // build one at a time.
        for link in &self.links {
            link::build_link(&self.handle, &self.prj_id, link).await?;
        }

        let mut set: JoinSet<Result<()>> = JoinSet::new();
        for runtime_bridge in &self.bridges {
            let runtime_bridge = runtime_bridge.clone();
            let handle = self.handle.clone();
            let prj_id = self.prj_id.clone();
            set.spawn(async move { bridge::build_bridge(&handle, &prj_id, &runtime_bridge).await });
        }
        join_first_error(&mut set).await?;

        let config_dir = self.config_dir();
        let messages: Arc<Mutex<Vec<NodeMessages>>> = Arc::new(Mutex::new(Vec::new()));

        let mut set: JoinSet<Result<()>> = JoinSet::new();
        for node in &self.nodes {
            let node = node.clone();
            let config_dir = config_dir.clone();
            let messages = messages.clone();
            set.spawn(async move {
                let name = node.name().to_string();
                let node_messages = node
                    .load_config(&config_dir)
                    .await
                    .map_err(Error::context("load config of", "node", name.clone()))?;
                messages
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(NodeMessages { name, messages: node_messages });
                Ok(())
            });
        }
        join_first_error(&mut set).await?;

        self.running = true;

        let mut messages = match Arc::try_unwrap(messages) {
            Ok(collected) => collected.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner),
            Err(_) => Vec::new(),
        };
        messages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(messages)
    }

    /// Close, load again and, when the manager was running, run again.
    pub async fn reload(&mut self) -> Result<Vec<NodeMessages>> {
        let was_running = self.running;

        self.close().await;
        self.load().await?;

        if was_running {
            self.run().await
        } else {
            Ok(Vec::new())
        }
    }

    /// Restart one node and reload its config. A warning and a no-op when
    /// the topology is not running.
    pub async fn start(&mut self, name: &str) -> Result<Vec<String>> {
        if !self.running {
            tracing::warn!(project = %self.prj_id, node = name, "topology is not running, start ignored");
            return Ok(Vec::new());
        }

        let node = self.require_node(name)?;
        node.start().await.map_err(Error::context("start", "node", name))?;
        node.load_config(&self.config_dir())
            .await
            .map_err(Error::context("load config of", "node", name))
    }

    /// Stop one node. A warning and a no-op when the topology is not
    /// running.
    pub async fn stop(&mut self, name: &str) -> Result<()> {
        if !self.running {
            tracing::warn!(project = %self.prj_id, node = name, "topology is not running, stop ignored");
            return Ok(());
        }

        let node = self.require_node(name)?;
        node.stop().await.map_err(Error::context("stop", "node", name))
    }

    /// Save every node's config under `configs/`, creating the directory on
    /// first use. The layout below it belongs to the node variants.
    pub async fn save(&self) -> Result<()> {
        let config_dir = self.config_dir();
        if !config_dir.exists() {
            use std::os::unix::fs::DirBuilderExt as _;
            std::fs::DirBuilder::new()
                .mode(0o755)
                .create(&config_dir)
                .map_err(Error::context("create", "configs dir", config_dir.display().to_string()))?;
        }

        let mut set: JoinSet<Result<()>> = JoinSet::new();
        for node in &self.nodes {
            let node = node.clone();
            let config_dir = config_dir.clone();
            set.spawn(async move {
                let name = node.name().to_string();
                node.save(&config_dir).await.map_err(Error::context("save", "node", name))
            });
        }
        join_first_error(&mut set).await
    }

    /// Copy a file in or out of a node. Exactly one of the two arguments
    /// must name a container as `<node>:<path>`.
    pub async fn copy(&self, source: &str, dest: &str) -> Result<()> {
        let (source_node, source_path) = split_copy_arg(source);
        let (dest_node, dest_path) = split_copy_arg(dest);

        match (source_node, dest_node) {
            (Some(_), Some(_)) => Err(Error::CopyBetweenContainers),
            (None, None) => Err(Error::CopyWithoutContainer),
            (Some(name), None) => {
                let node = self.require_node(name)?;
                if !node.supports_copy() {
                    return Err(Error::CopyUnsupported(name.to_string()));
                }
                node.copy_from(source_path, Path::new(dest_path))
                    .await
                    .map_err(Error::context("copy from", "node", name))
            }
            (None, Some(name)) => {
                let node = self.require_node(name)?;
                if !node.supports_copy() {
                    return Err(Error::CopyUnsupported(name.to_string()));
                }
                node.copy_to(Path::new(source_path), dest_path)
                    .await
                    .map_err(Error::context("copy to", "node", name))
            }
        }
    }

    /// Tear the whole scene down. Never fails: every resource error is
    /// logged and teardown keeps going. Idempotent.
    ///
    /// Bridges go first — their legs are deleted from the root side, so
    /// dismantling cannot race the member namespaces disappearing — then all
    /// nodes concurrently, then the id pool, then the OVS instance.
    pub async fn close(&mut self) {
        for runtime_bridge in std::mem::take(&mut self.bridges) {
            bridge::teardown_bridge(&runtime_bridge).await;
        }

        let mut set = JoinSet::new();
        for node in std::mem::take(&mut self.nodes) {
            set.spawn(async move {
                if let Err(e) = node.close().await {
                    tracing::error!(node = %node.name(), error = %e, "error when closing node");
                }
            });
        }
        while set.join_next().await.is_some() {}

        self.links.clear();
        self.id_gen.close();

        if let Some(ovs) = self.ovs.take() {
            if let Err(e) = ovs.close().await {
                tracing::error!(project = %self.prj_id, error = %e, "error when closing ovs instance");
            }
        }

        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn get_all_nodes(&self) -> &[Arc<dyn NetemNode>] {
        &self.nodes
    }

    pub fn get_node(&self, name: &str) -> Option<Arc<dyn NetemNode>> {
        self.nodes.iter().find(|node| node.name() == name).cloned()
    }

    pub fn read_network_file(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.network_file_path())?)
    }

    pub fn write_network_file(&self, data: &[u8]) -> Result<()> {
        use std::os::unix::fs::PermissionsExt as _;

        let path = self.network_file_path();
        std::fs::write(&path, data)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;
        Ok(())
    }

    fn require_node(&self, name: &str) -> Result<Arc<dyn NetemNode>> {
        self.get_node(name).ok_or_else(|| Error::NodeNotFound(name.to_string()))
    }
}

/// Wait for every task in the set and surface the first error.
async fn join_first_error(set: &mut JoinSet<Result<()>>) -> Result<()> {
    let mut first = None;
    while let Some(joined) = set.join_next().await {
        let result = joined.unwrap_or_else(|e| Err(Error::from(e)));
        if let Err(e) = result {
            if first.is_none() {
                first = Some(e);
            }
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Split a copy argument into `(container, path)`.
///
/// Absolute paths and explicit relative paths (`./x:y`) are always local,
/// matching the docker CLI convention.
fn split_copy_arg(arg: &str) -> (Option<&str>, &str) {
    if arg.starts_with('/') {
        return (None, arg);
    }

    match arg.split_once(':') {
        Some((container, path)) if !container.is_empty() && !container.starts_with('.') => {
            (Some(container), path)
        }
        _ => (None, arg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_with(network_yml: &str) -> (tempfile::TempDir, TopologyManager) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(NETWORK_FILENAME), network_yml).unwrap();
        let manager = TopologyManager::new("tst", dir.path(), Config::default()).unwrap();
        (dir, manager)
    }

    #[test]
    fn split_copy_arg_resolution() {
        assert_eq!(split_copy_arg("/tmp/a"), (None, "/tmp/a"));
        assert_eq!(split_copy_arg("r1:/etc/frr/frr.conf"), (Some("r1"), "/etc/frr/frr.conf"));
        assert_eq!(split_copy_arg("./local:file"), (None, "./local:file"));
        assert_eq!(split_copy_arg("plain"), (None, "plain"));
        assert_eq!(split_copy_arg(":/oops"), (None, ":/oops"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn check_accepts_a_valid_document() {
        let _ = tracing_subscriber::fmt::try_init();
        let (_dir, manager) = project_with(
            "nodes:\n  r1: {type: router}\n  r2: {type: router}\nlinks:\n  - {peer1: r1.0, peer2: r2.0}\n",
        );
        manager.check().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn check_reports_every_problem() {
        let (_dir, manager) =
            project_with("nodes:\n  r1: {type: warp}\nlinks:\n  - {peer1: r1.0, peer2: r9.0}\n");

        let err = manager.check().unwrap_err();
        let Error::Validation(errors) = err else { panic!("expected validation error") };
        assert_eq!(errors.len(), 2, "{errors:?}");

        let rendered = Error::Validation(errors).to_string();
        assert!(rendered.starts_with("topology is not valid:\n\t"), "{rendered}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn check_reports_a_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TopologyManager::new("tst", dir.path(), Config::default()).unwrap();
        assert!(matches!(manager.check(), Err(Error::Validation(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_without_load_is_a_state_error() {
        let (_dir, mut manager) = project_with("nodes: {}\n");
        assert!(matches!(manager.run().await, Err(Error::NotLoaded)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_and_stop_warn_when_not_running() {
        let (_dir, mut manager) = project_with("nodes: {}\n");
        assert!(!manager.is_running());

        // Not even a lookup happens: the running guard comes first.
        assert_eq!(manager.start("ghost").await.unwrap(), Vec::<String>::new());
        manager.stop("ghost").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn copy_rejects_both_and_neither_container() {
        let (_dir, manager) = project_with("nodes: {}\n");

        let err = manager.copy("r1:/a", "r2:/b").await.unwrap_err();
        assert_eq!(err.to_string(), "copying between containers is not supported");

        let err = manager.copy("/a", "/b").await.unwrap_err();
        assert_eq!(err.to_string(), "a container must be specified on one side of the copy");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn copy_requires_a_known_node() {
        let (_dir, manager) = project_with("nodes: {}\n");
        let err = manager.copy("r1:/a", "/b").await.unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(name) if name == "r1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn network_file_round_trips() {
        let (_dir, manager) = project_with("nodes: {}\n");

        let contents = manager.read_network_file().unwrap();
        assert_eq!(contents, b"nodes: {}\n");

        manager.write_network_file(b"nodes:\n  r1: {type: router}\n").unwrap();
        let reread = manager.read_network_file().unwrap();
        assert!(String::from_utf8(reread).unwrap().contains("r1"));
        manager.check().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_creates_the_configs_dir() {
        let (dir, manager) = project_with("nodes: {}\n");
        manager.save().await.unwrap();

        let metadata = std::fs::metadata(dir.path().join(CONFIG_DIR)).unwrap();
        assert!(metadata.is_dir());

        // second save is happy with the existing directory
        manager.save().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_is_idempotent_on_an_empty_manager() {
        let (_dir, mut manager) = project_with("nodes: {}\n");
        manager.close().await;
        manager.close().await;
        assert!(!manager.is_running());
        assert!(manager.get_all_nodes().is_empty());
    }
}
