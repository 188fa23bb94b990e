//! IP-CIDR / SRC-IP-CIDR prefix matching, via `ipnetwork` (grounded in
//! `other_examples/efa2dff2_simophin-cpxy`'s `TrafficMatchRule::Network`).

use std::net::IpAddr;

use ipnetwork::IpNetwork;

pub fn ip_in_cidr(ip: IpAddr, cidr: IpNetwork) -> bool {
    cidr.contains(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_contained_address() {
        let cidr: IpNetwork = "8.8.8.0/24".parse().unwrap();
        assert!(ip_in_cidr("8.8.8.8".parse().unwrap(), cidr));
        assert!(!ip_in_cidr("1.1.1.1".parse().unwrap(), cidr));
    }
}
