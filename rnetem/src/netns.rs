//! Network-namespace handles.
//!
//! A [`NetnsHandle`] is a refcounted open descriptor of a namespace file
//! (`/proc/<pid>/ns/net`). Cloning the handle shares the descriptor; the
//! kernel reference is released when the last clone drops, so acquisition is
//! scoped on every exit path by construction.

use std::fs::File;
use std::os::fd::{AsFd as _, AsRawFd as _, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use nix::sched::{setns, CloneFlags};
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Refcounted handle on a network namespace.
#[derive(Debug, Clone)]
pub struct NetnsHandle {
    file: Arc<File>,
}

impl NetnsHandle {
    /// Handle on the namespace of a running process.
    pub fn from_pid(pid: u32) -> std::io::Result<Self> {
        let path = PathBuf::from(format!("/proc/{pid}/ns/net"));
        Ok(Self { file: Arc::new(File::open(path)?) })
    }

    /// Handle on the calling process's namespace (the root namespace for the
    /// daemon, which never changes namespace itself).
    pub fn current() -> std::io::Result<Self> {
        Ok(Self { file: Arc::new(File::open("/proc/self/ns/net")?) })
    }

    /// Raw descriptor, for `setns_by_fd` on link requests.
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Run an async closure inside this namespace.
    ///
    /// The closure receives an [`rtnetlink::Handle`] whose socket was opened
    /// *inside* the namespace, so link and qdisc requests target the right
    /// network stack. A dedicated OS thread is spawned per call: `setns(2)`
    /// changes the calling thread permanently, and the main runtime's pooled
    /// threads must never leave the root namespace. The thread runs a
    /// current-thread runtime for the closure and exits when it resolves.
    pub async fn enter<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(rtnetlink::Handle) -> BoxFuture<'static, Result<T>> + Send + 'static,
    {
        let ns = self.clone();
        let (tx, rx) = oneshot::channel();

        std::thread::Builder::new().name("rnetem-netns".into()).spawn(move || {
            let result = (|| -> Result<T> {
                setns(ns.file.as_fd(), CloneFlags::CLONE_NEWNET)?;

                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;

                runtime.block_on(async move {
                    let (connection, handle, _) = rtnetlink::new_connection()?;
                    tokio::spawn(connection);

                    f(handle).await
                })
            })();

            // The receiver only disappears if the caller was cancelled.
            let _ = tx.send(result);
        })?;

        rx.await.map_err(|_| Error::NamespaceWorkerGone)?
    }
}
