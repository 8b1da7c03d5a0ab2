//! RFC 6724 destination-address ordering.
//!
//! Resolved addresses are sorted by the destination-side subset of RFC 6724
//! section 6: each address is matched against the section 2.1 policy table
//! (longest prefix wins, IPv4 addresses in their mapped form) and ordered by
//! descending precedence. The sort is stable, so addresses of equal
//! precedence keep their arrival order.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// One row of the RFC 6724 section 2.1 policy table.
struct PolicyEntry {
    prefix: Ipv6Addr,
    prefix_len: u32,
    precedence: u8,
    label: u8,
}

const fn entry(prefix: Ipv6Addr, prefix_len: u32, precedence: u8, label: u8) -> PolicyEntry {
    PolicyEntry { prefix, prefix_len, precedence, label }
}

/// The default policy table, verbatim from RFC 6724 section 2.1.
static POLICY_TABLE: &[PolicyEntry] = &[
    // ::1/128, loopback
    entry(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1), 128, 50, 0),
    // ::/0, default
    entry(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 0, 40, 1),
    // ::ffff:0:0/96, IPv4-mapped
    entry(Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0, 0), 96, 35, 4),
    // 2002::/16, 6to4
    entry(Ipv6Addr::new(0x2002, 0, 0, 0, 0, 0, 0, 0), 16, 30, 2),
    // 2001::/32, Teredo
    entry(Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0), 32, 5, 5),
    // fc00::/7, unique-local
    entry(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7, 3, 13),
    // ::/96, IPv4-compatible (deprecated)
    entry(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 96, 1, 3),
    // fec0::/10, site-local (deprecated)
    entry(Ipv6Addr::new(0xfec0, 0, 0, 0, 0, 0, 0, 0), 10, 1, 11),
    // 3ffe::/16, 6bone (returned)
    entry(Ipv6Addr::new(0x3ffe, 0, 0, 0, 0, 0, 0, 0), 16, 1, 12),
];

fn mapped(ip: &IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => *v6,
    }
}

fn prefix_matches(addr: Ipv6Addr, prefix: Ipv6Addr, len: u32) -> bool {
    if len == 0 {
        return true;
    }
    let a = u128::from_be_bytes(addr.octets());
    let p = u128::from_be_bytes(prefix.octets());
    (a ^ p) >> (128 - len) == 0
}

fn lookup(ip: &IpAddr) -> &'static PolicyEntry {
    let addr = mapped(ip);
    POLICY_TABLE
        .iter()
        .filter(|e| prefix_matches(addr, e.prefix, e.prefix_len))
        .max_by_key(|e| e.prefix_len)
        // The ::/0 row matches everything.
        .unwrap()
}

/// RFC 6724 precedence of a destination address.
pub fn precedence(ip: &IpAddr) -> u8 {
    lookup(ip).precedence
}

/// RFC 6724 label of a destination address.
pub fn label(ip: &IpAddr) -> u8 {
    lookup(ip).label
}

/// Sorts resolved addresses by RFC 6724 destination preference.
///
/// Stable: addresses with equal policy keep their relative input order. The
/// output is always a permutation of the input.
pub fn rfc6724_sort(addrs: &mut [SocketAddr]) {
    addrs.sort_by_key(|addr| std::cmp::Reverse(precedence(&addr.ip())));
}
