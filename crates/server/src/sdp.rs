//! SDP answer post-processing.
//!
//! The answer handed back to a client must not leak candidates bound to
//! private addresses: they are unreachable from the client anyway and
//! expose the server's internal topology. Every `a=candidate:` line whose
//! connection address parses to a private, loopback, link-local, CGNAT, or
//! unique-local range is removed before serialization.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Removes candidates with non-public addresses from an SDP description.
///
/// Lines that are not candidates, and candidates whose address does not
/// parse as an IP literal (mDNS hostnames), pass through untouched.
pub fn filter_answer(sdp: &str) -> String {
    let mut out = String::with_capacity(sdp.len());
    for line in sdp.split_inclusive('\n') {
        if let Some(address) = candidate_address(line) {
            if !is_public(address) {
                continue;
            }
        }
        out.push_str(line);
    }
    out
}

/// Extracts the connection address of an `a=candidate:` line, if any.
fn candidate_address(line: &str) -> Option<IpAddr> {
    let rest = line.trim_start().strip_prefix("a=candidate:")?;
    // candidate:<foundation> <component> <transport> <priority> <address> <port> typ ...
    let address = rest.split_whitespace().nth(4)?;
    address.parse().ok()
}

fn is_public(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => !is_private_v4(v4),
        IpAddr::V6(v6) => !is_private_v6(v6),
    }
}

fn is_private_v4(address: Ipv4Addr) -> bool {
    let octets = address.octets();
    address.is_private()
        || address.is_loopback()
        || address.is_link_local()
        || address.is_unspecified()
        // CGNAT 100.64.0.0/10
        || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
}

fn is_private_v6(address: Ipv6Addr) -> bool {
    let segments = address.segments();
    address.is_loopback()
        || address.is_unspecified()
        // Unique-local fc00::/7
        || (segments[0] & 0xFE00) == 0xFC00
        // Link-local fe80::/10
        || (segments[0] & 0xFFC0) == 0xFE80
}
