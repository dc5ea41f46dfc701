//! Per-project Open vSwitch instance.
//!
//! One container per project carries every `ovs`-typed node as a bridge
//! inside it. The instance is created (not started) during `Load`, started
//! before any node during `Run`, and closed after all nodes during `Close`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::docker;
use crate::error::{Error, Result};
use crate::netns::NetnsHandle;
use crate::NETEM_ID;

/// How long to wait for ovsdb to answer after the container starts.
const OVSDB_WAIT_ATTEMPTS: u32 = 20;
const OVSDB_WAIT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct State {
    started: bool,
    closed: bool,
    netns: Option<NetnsHandle>,
}

#[derive(Debug)]
pub struct OvsProjectInstance {
    prj_id: String,
    container: String,
    state: Mutex<State>,
}

impl OvsProjectInstance {
    /// Create the switch container for a project. It stays stopped until
    /// [`start`](Self::start).
    pub async fn create(prj_id: &str, image: &str) -> Result<Arc<Self>> {
        let container = format!("{NETEM_ID}{prj_id}_ovs");

        docker::create(image, &container, "ovs", &[], &[]).await?;

        Ok(Arc::new(Self {
            prj_id: prj_id.to_string(),
            container,
            state: Mutex::new(State { started: false, closed: false, netns: None }),
        }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("ovs state poisoned")
    }

    /// Start the container and wait until ovsdb accepts commands.
    pub async fn start(&self) -> Result<()> {
        if self.lock().started {
            return Ok(());
        }

        docker::start(&self.container).await?;
        let pid = docker::pid(&self.container).await?;
        let ns = NetnsHandle::from_pid(pid)?;

        let mut ready = false;
        for _ in 0..OVSDB_WAIT_ATTEMPTS {
            if docker::exec(&self.container, ["ovs-vsctl", "--timeout=2", "show"]).await.is_ok() {
                ready = true;
                break;
            }
            tokio::time::sleep(OVSDB_WAIT_INTERVAL).await;
        }
        if !ready {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "ovsdb never became ready",
            )));
        }

        let mut state = self.lock();
        state.started = true;
        state.netns = Some(ns);

        tracing::debug!(project = %self.prj_id, container = %self.container, "ovs instance started");
        Ok(())
    }

    /// Namespace of the switch container; ovs node legs are patched in here.
    pub fn netns(&self) -> Result<NetnsHandle> {
        self.lock()
            .netns
            .clone()
            .ok_or_else(|| Error::NodeNotRunning(format!("ovs instance of {}", self.prj_id)))
    }

    pub async fn add_bridge(&self, name: &str) -> Result<()> {
        docker::exec(&self.container, ["ovs-vsctl", "--may-exist", "add-br", name]).await?;
        Ok(())
    }

    pub async fn del_bridge(&self, name: &str) -> Result<()> {
        docker::exec(&self.container, ["ovs-vsctl", "--if-exists", "del-br", name]).await?;
        Ok(())
    }

    pub async fn add_port(&self, bridge: &str, port: &str) -> Result<()> {
        docker::exec(&self.container, ["ovs-vsctl", "--may-exist", "add-port", bridge, port])
            .await?;
        Ok(())
    }

    /// Remove the container. Idempotent; the manager logs failures instead
    /// of propagating them.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.started = false;
            state.netns = None;
        }

        docker::remove(&self.container).await?;
        Ok(())
    }
}
