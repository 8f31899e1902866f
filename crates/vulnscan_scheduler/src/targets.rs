//! Target expansion: IPs and hostnames pass through, CIDR blocks enumerate.
//!
//! `count` and `expand` agree: flattening `chunk(expand(targets))` always
//! yields exactly `count(targets)` addresses, which is what progress
//! accounting relies on. Malformed specifiers are treated as single opaque
//! addresses.

use ipnet::{IpNet, Ipv4AddrRange, Ipv6AddrRange};

/// Enumerate every address a list of target specifiers covers, in order.
pub fn expand(targets: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for target in targets {
        expand_one(target, &mut out);
    }
    out
}

fn expand_one(target: &str, out: &mut Vec<String>) {
    if target.contains('/') {
        if let Ok(net) = target.parse::<IpNet>() {
            match net {
                IpNet::V4(v4) => {
                    for addr in Ipv4AddrRange::new(v4.network(), v4.broadcast()) {
                        out.push(addr.to_string());
                    }
                }
                IpNet::V6(v6) => {
                    for addr in Ipv6AddrRange::new(v6.network(), v6.broadcast()) {
                        out.push(addr.to_string());
                    }
                }
            }
            return;
        }
    }
    out.push(target.to_string());
}

/// Total cardinality without materializing large ranges. IPv6 blocks wider
/// than 64 bits saturate to `u64::MAX`.
pub fn count(targets: &[String]) -> u64 {
    targets.iter().map(|t| count_one(t)).sum()
}

fn count_one(target: &str) -> u64 {
    if target.contains('/') {
        if let Ok(net) = target.parse::<IpNet>() {
            return match net {
                IpNet::V4(v4) => 1u64 << (32 - u32::from(v4.prefix_len())),
                IpNet::V6(v6) => {
                    let bits = 128 - u32::from(v6.prefix_len());
                    if bits >= 64 {
                        u64::MAX
                    } else {
                        1u64 << bits
                    }
                }
            };
        }
    }
    1
}

/// Partition addresses into chunks of at most `chunk_size`, preserving order.
pub fn chunk(addresses: &[String], chunk_size: usize) -> Vec<Vec<String>> {
    let chunk_size = chunk_size.max(1);
    addresses
        .chunks(chunk_size)
        .map(|part| part.to_vec())
        .collect()
}

/// Expand and chunk in one step.
pub fn split_targets(targets: &[String], chunk_size: usize) -> Vec<Vec<String>> {
    chunk(&expand(targets), chunk_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_ips_and_hostnames_pass_through() {
        let targets = strings(&["192.168.1.1", "example.com"]);
        assert_eq!(count(&targets), 2);
        assert_eq!(expand(&targets), targets);
    }

    #[test]
    fn slash_30_expands_to_four_addresses() {
        let targets = strings(&["192.168.1.0/30"]);
        assert_eq!(count(&targets), 4);
        let expanded = expand(&targets);
        assert_eq!(
            expanded,
            strings(&["192.168.1.0", "192.168.1.1", "192.168.1.2", "192.168.1.3"])
        );
    }

    #[test]
    fn host_prefixes_expand_to_single_host() {
        assert_eq!(expand(&strings(&["10.1.2.3/32"])), strings(&["10.1.2.3"]));
        assert_eq!(count(&strings(&["10.1.2.3/32"])), 1);
        assert_eq!(expand(&strings(&["2001:db8::1/128"])), strings(&["2001:db8::1"]));
        assert_eq!(count(&strings(&["2001:db8::1/128"])), 1);
    }

    #[test]
    fn malformed_specifiers_are_opaque_singles() {
        let targets = strings(&["999.999.0.0/40", "not a host"]);
        assert_eq!(count(&targets), 2);
        assert_eq!(expand(&targets), targets);
    }

    #[test]
    fn count_matches_expand_cardinality() {
        let targets = strings(&[
            "192.168.1.0/29",
            "10.0.0.1",
            "scanme.example",
            "172.16.0.0/30",
        ]);
        assert_eq!(count(&targets), expand(&targets).len() as u64);
    }

    #[test]
    fn chunking_preserves_order_and_sizes() {
        let chunks = split_targets(&strings(&["a.com", "b.com", "c.com"]), 2);
        assert_eq!(
            chunks,
            vec![strings(&["a.com", "b.com"]), strings(&["c.com"])]
        );
    }

    #[test]
    fn chunked_expansion_flattens_back() {
        let targets = strings(&["192.168.1.0/28", "one.example"]);
        let expanded = expand(&targets);
        let chunks = split_targets(&targets, 5);
        assert!(chunks.iter().all(|c| c.len() <= 5));
        let flattened: Vec<String> = chunks.into_iter().flatten().collect();
        assert_eq!(flattened, expanded);
        assert_eq!(flattened.len() as u64, count(&targets));
    }
}
