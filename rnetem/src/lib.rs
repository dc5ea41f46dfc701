//! # rnetem
//!
//! Core of a network-emulation daemon. A project is a declarative topology
//! (`network.yml`: nodes, point-to-point links, host bridges) that the
//! [`TopologyManager`] materializes into live kernel state: one container
//! per node in its own network namespace, veth pairs wiring them together,
//! netem/tbf qdiscs for link impairments, kernel bridges toward host NICs,
//! and one Open vSwitch container per project for L2 switching.
//!
//! ```text
//!   network.yml ──validate──▶ topology graph ──Load──▶ containers + OVS
//!                                                │
//!                                               Run ──▶ namespaces wired:
//!                                                │      veth + netem/tbf
//!                                              Close ─▶ everything released
//! ```
//!
//! The remote-call server consuming this crate lives elsewhere; the manager
//! surface in [`manager`] is its contract.

pub mod bridge;
pub mod config;
pub mod docker;
pub mod error;
pub mod idgen;
pub mod link;
pub mod manager;
pub mod netns;
pub mod node;
pub mod ovs;
pub mod topology;

pub use config::Config;
pub use error::{Error, Result};
pub use manager::{NodeMessages, TopologyManager};

/// Fixed prefix embedded in every generated kernel name (interfaces,
/// bridges, containers) so anything the daemon creates is recognizable
/// host-wide.
pub const NETEM_ID: &str = "ntm";
