//! # Traffic-control request builders
//!
//! Netlink request builders for the two queuing disciplines the emulation
//! daemon installs on virtual-ethernet legs: `netem` (delay, jitter, loss)
//! and `tbf` (token-bucket rate shaping). Requests are built by encoding the
//! kernel's `tc_netem_qopt` / `tc_tbf_qopt` structures by hand and are
//! executed against an [`rtnetlink::Handle`] that must be bound inside the
//! namespace owning the interface.
//!
//! ## Qdisc layout
//!
//! Every emulated link leg carries at most two qdiscs, applied to all
//! traffic on the interface:
//!
//! ```text
//! netem root (1:0)        delay / jitter / loss, when any is non-zero
//!   └── tbf (10:0)        rate shaping, when a rate is configured
//! ```
//!
//! When no netem parameter is set but a rate is, the tbf qdisc sits at the
//! root instead. Handles are fixed because there is exactly one chain per
//! interface.

pub mod core;
pub mod netem;
mod nla;
pub mod qdisc;
pub mod tbf;

pub use qdisc::{install_impairments, Impairment};
