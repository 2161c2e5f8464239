//! Caller IP allow-listing

use std::net::IpAddr;
use tracing::warn;

use crate::config::AuthorizedIps;

/// Returns true if the caller may proceed. An absent allow-list admits everyone.
pub fn is_authorized(ip: IpAddr, authorized_ips: Option<&AuthorizedIps>) -> bool {
    match authorized_ips {
        None => true,
        Some(allowed) => allowed
            .patterns()
            .iter()
            .any(|pattern| ip_matches(ip, pattern)),
    }
}

/// Checks an address against a literal IP or a CIDR range such as `10.0.0.0/8`.
/// Malformed patterns never match.
pub fn ip_matches(ip: IpAddr, pattern: &str) -> bool {
    let ip = ip.to_canonical();
    let pattern = pattern.trim();

    let (network, prefix) = match pattern.split_once('/') {
        Some((addr, bits)) => match bits.parse::<u8>() {
            Ok(bits) => (addr, Some(bits)),
            Err(_) => {
                warn!("Ignoring malformed authorized_ips entry {:?}", pattern);
                return false;
            }
        },
        None => (pattern, None),
    };

    let network = match network.parse::<IpAddr>() {
        Ok(addr) => addr.to_canonical(),
        Err(_) => {
            warn!("Ignoring malformed authorized_ips entry {:?}", pattern);
            return false;
        }
    };

    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            prefix_matches(u32::from(ip).into(), u32::from(net).into(), prefix, 32)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            prefix_matches(u128::from(ip), u128::from(net), prefix, 128)
        }
        _ => false,
    }
}

fn prefix_matches(ip: u128, network: u128, prefix: Option<u8>, width: u8) -> bool {
    let prefix = prefix.unwrap_or(width);
    if prefix > width {
        return false;
    }
    if prefix == 0 {
        return true;
    }
    let shift = u32::from(width - prefix);
    (ip >> shift) == (network >> shift)
}
