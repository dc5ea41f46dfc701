//! Time conversion for the packet scheduler.
//!
//! The kernel's traffic-control subsystem expresses delay and burst values in
//! its own "ticks". The tick rate is published in `/proc/net/psched`; the
//! conversion below mirrors `tc_core_init()` in iproute2.

use std::io::{self, Read as _};
use std::sync::LazyLock;

/// Path to the kernel's packet scheduler timing information.
pub const PSCHED_PATH: &str = "/proc/net/psched";

/// Standard Ethernet MTU in bytes.
pub const MTU_ETHERNET: u32 = 1_500;

/// Read the tick rate from `/proc/net/psched`.
///
/// The file holds four hex values; the ratio of the first two is the number
/// of scheduler ticks per microsecond.
pub fn tc_core_init() -> io::Result<f64> {
    let mut file = std::fs::File::open(PSCHED_PATH)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let mut iter = contents.split_whitespace();

    let t2us = u32::from_str_radix(iter.next().expect("t2us"), 16).expect("t2us hex");
    let us2t = u32::from_str_radix(iter.next().expect("us2t"), 16).expect("us2t hex");

    let tick_in_usec = t2us as f64 / us2t as f64;

    tracing::debug!(t2us, us2t, tick_in_usec, "read {PSCHED_PATH}");

    Ok(tick_in_usec)
}

/// Ticks per microsecond, read once on first use.
pub static TICK_IN_USEC: LazyLock<f64> =
    LazyLock::new(|| tc_core_init().expect("to read /proc/net/psched"));

/// Convert microseconds to packet scheduler ticks.
pub fn usec_to_ticks(usec: u32) -> u32 {
    (usec as f64 * *TICK_IN_USEC) as u32
}
