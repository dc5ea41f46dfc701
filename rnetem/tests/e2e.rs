//! End-to-end scenarios against a real kernel and docker daemon.
//!
//! These tests create containers, namespaces and veth pairs; they need root
//! and a running docker daemon with the stock images pulled, so they are
//! ignored by default:
//!
//! ```sh
//! sudo -E cargo test -p rnetem --test e2e -- --ignored
//! ```

use rnetem::manager::NETWORK_FILENAME;
use rnetem::node::NodeStatus;
use rnetem::{docker, Config, TopologyManager};

fn project(prj_id: &str, network_yml: &str) -> (tempfile::TempDir, TopologyManager) {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(NETWORK_FILENAME), network_yml).unwrap();
    let manager = TopologyManager::new(prj_id, dir.path(), Config::default()).unwrap();
    (dir, manager)
}

/// Kernel names created by a project, as seen from the root namespace.
async fn root_links_with_prefix(prefix: &str) -> Vec<String> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir("/sys/class/net").unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().to_string();
        if name.starts_with(prefix) {
            names.push(name);
        }
    }
    names
}

async fn containers_with_prefix(prefix: &str) -> Vec<String> {
    let output = docker::run(["ps", "--all", "--format", "{{.Names}}"]).await.unwrap();
    output
        .stdout
        .lines()
        .filter(|name| name.starts_with(prefix))
        .map(String::from)
        .collect()
}

/// S1: two routers, one unimpaired link.
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires root and a docker daemon"]
async fn two_routers_one_link() {
    let (_dir, mut manager) = project(
        "e2a",
        "nodes:\n  r1: {type: router}\n  r2: {type: router}\nlinks:\n  - {peer1: r1.0, peer2: r2.0}\n",
    );

    manager.load().await.unwrap();
    let messages = manager.run().await.unwrap();
    assert!(manager.is_running());
    assert_eq!(messages.len(), 2);

    for node in manager.get_all_nodes() {
        assert_eq!(node.status(), NodeStatus::Started);
    }

    // Each end sits in its peer's namespace, up, with no qdisc chain.
    for (container, ifname) in [("ntme2a.r1", "e2ar1.0"), ("ntme2a.r2", "e2ar2.0")] {
        let output = docker::exec(container, ["ip", "link", "show", "dev", ifname]).await.unwrap();
        assert!(output.stdout.contains("UP"), "{ifname} is not up: {}", output.stdout);

        let qdiscs = docker::exec(container, ["tc", "qdisc", "show", "dev", ifname]).await.unwrap();
        assert!(!qdiscs.stdout.contains("netem"), "unexpected netem on {ifname}");
        assert!(!qdiscs.stdout.contains("tbf"), "unexpected tbf on {ifname}");
    }

    manager.close().await;
    assert!(root_links_with_prefix("e2a").await.is_empty());
    assert!(containers_with_prefix("ntme2a").await.is_empty());
}

/// S2: the same link with delay, jitter, loss and rate carries both qdiscs.
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires root and a docker daemon"]
async fn impaired_link_carries_netem_and_tbf() {
    let (_dir, mut manager) = project(
        "e2b",
        "nodes:\n  r1: {type: router}\n  r2: {type: router}\n\
         links:\n  - {peer1: r1.0, peer2: r2.0, delay: 50, jitter: 5, loss: 1.5, rate: 1000}\n",
    );

    manager.load().await.unwrap();
    manager.run().await.unwrap();

    for (container, ifname) in [("ntme2b.r1", "e2br1.0"), ("ntme2b.r2", "e2br2.0")] {
        let qdiscs = docker::exec(container, ["tc", "qdisc", "show", "dev", ifname]).await.unwrap();
        assert!(qdiscs.stdout.contains("netem"), "missing netem on {ifname}: {}", qdiscs.stdout);
        assert!(qdiscs.stdout.contains("tbf"), "missing tbf on {ifname}: {}", qdiscs.stdout);
        assert!(qdiscs.stdout.contains("delay"), "missing delay on {ifname}: {}", qdiscs.stdout);
    }

    manager.close().await;
}

/// S3: a host bridge enslaving a NIC and one host leg.
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires root and a docker daemon"]
async fn host_bridge_wires_nic_and_leg() {
    // A dummy device stands in for the host NIC.
    let host_nic = "rnetem-dum0";
    let (connection, handle, _) = rtnetlink::new_connection().unwrap();
    tokio::spawn(connection);
    handle
        .link()
        .add(rtnetlink::LinkDummy::new(host_nic).up().build())
        .execute()
        .await
        .unwrap();

    let (_dir, mut manager) = project(
        "e2c",
        &format!(
            "nodes:\n  h1: {{type: host}}\nbridges:\n  br0: {{host: {host_nic}, interfaces: [h1.0]}}\n"
        ),
    );

    manager.load().await.unwrap();
    manager.run().await.unwrap();

    // Bridge device and root-side leg exist in the root namespace.
    let names = root_links_with_prefix("ntme2c").await;
    assert!(names.contains(&"ntme2c.br".to_string()), "{names:?}");
    assert!(names.contains(&"ntme2ch1.0".to_string()), "{names:?}");

    // Peer-side leg lives inside h1.
    let output =
        docker::exec("ntme2c.h1", ["ip", "link", "show", "dev", "ntme2c0.h1"]).await.unwrap();
    assert!(output.stdout.contains("UP"), "{}", output.stdout);

    manager.close().await;
    assert!(root_links_with_prefix("ntme2c").await.is_empty());

    // The stand-in NIC survives teardown and is cleaned by the test itself.
    let index = nix::net::if_::if_nametoindex(host_nic).unwrap();
    handle.link().del(index).execute().await.unwrap();
}

/// S4: reload preserves the running state and returns the second run's
/// messages.
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires root and a docker daemon"]
async fn reload_preserves_running_state() {
    let (_dir, mut manager) = project(
        "e2d",
        "nodes:\n  r1: {type: router}\n  r2: {type: router}\nlinks:\n  - {peer1: r1.0, peer2: r2.0}\n",
    );

    manager.load().await.unwrap();
    manager.run().await.unwrap();
    assert!(manager.is_running());

    let messages = manager.reload().await.unwrap();
    assert!(manager.is_running());
    assert_eq!(messages.len(), 2);
    assert_eq!(manager.get_all_nodes().len(), 2);

    // Running again is a warning and a no-op.
    assert!(manager.run().await.unwrap().is_empty());

    manager.close().await;
}

/// S6: a failing node creation during Load leaves a closeable manager and no
/// residual containers.
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires root and a docker daemon"]
async fn close_cleans_up_after_partial_load() {
    let (_dir, mut manager) = project(
        "e2e",
        "nodes:\n  r1: {type: router}\n  r2: {type: router}\n  r3: {type: router, image: \"rnetem/does-not-exist:missing\"}\n",
    );

    let err = manager.load().await.unwrap_err();
    assert!(err.to_string().contains("unable to load the topology"), "{err}");

    // The two good nodes were created and are still registered.
    assert_eq!(manager.get_all_nodes().len(), 2);

    manager.close().await;
    assert!(containers_with_prefix("ntme2e").await.is_empty());
}
