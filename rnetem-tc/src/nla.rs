//! Netlink attribute building.
//!
//! Qdisc options travel inside a `TCA_OPTIONS` attribute, which for tbf
//! contains nested sub-attributes in the kernel's TLV format. These helpers
//! build the TLVs byte by byte.

use nix::libc::TCA_OPTIONS;
use rtnetlink::packet_utils::nla::{DefaultNla, NLA_HEADER_SIZE};

/// Build a single NLA: a 4-byte header (length, type) followed by the value,
/// padded to 4-byte alignment.
pub(crate) fn build_nla(nla_type: u16, value: &[u8]) -> Vec<u8> {
    // NLA length includes the 4-byte header
    let nla_len = NLA_HEADER_SIZE + value.len();
    let padded_len = (nla_len + 3) & !3;

    let mut buf = vec![0u8; padded_len];

    buf[0..2].copy_from_slice(&(nla_len as u16).to_ne_bytes());
    buf[2..4].copy_from_slice(&nla_type.to_ne_bytes());
    buf[NLA_HEADER_SIZE..NLA_HEADER_SIZE + value.len()].copy_from_slice(value);
    // padding bytes stay zero

    buf
}

/// Wrap already-encoded sub-attributes in a `TCA_OPTIONS` container.
pub(crate) fn build_nested_options(sub_attrs: Vec<u8>) -> DefaultNla {
    DefaultNla::new(TCA_OPTIONS, sub_attrs)
}
