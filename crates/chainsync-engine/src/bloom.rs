//! Log-bloom pre-filter for the realtime follower.
//!
//! A block header's 2048-bit bloom covers every log address and topic in the
//! block, so a missing bit proves a filter cannot match and the follower can
//! skip `eth_getLogs` for that block entirely. Membership can false-positive,
//! never false-negative.

use alloy_primitives::keccak256;

use chainsync_core::filter::{AddressCriteria, LogFilter, TopicCriteria};

const BLOOM_BYTES: usize = 256;

/// Whether `item` is (possibly) present in the bloom.
///
/// Three bits are derived from the first three 16-bit words of the item's
/// keccak hash, each taken mod 2048 and counted from the bloom's low end.
pub fn bloom_contains(bloom: &[u8], item: &[u8]) -> bool {
    if bloom.len() != BLOOM_BYTES {
        return true;
    }
    let hash = keccak256(item);
    (0..3).all(|i| {
        let bit = (u16::from_be_bytes([hash[2 * i], hash[2 * i + 1]]) & 0x07ff) as usize;
        let byte = BLOOM_BYTES - 1 - bit / 8;
        bloom[byte] & (1 << (bit % 8)) != 0
    })
}

/// Whether any of the chain's log filters could match a log in this block.
///
/// Per filter: AND across the address and topic categories, OR within each.
/// Criteria the bloom cannot decide (wildcards, child-address sets) pass.
pub fn filters_might_match(bloom_hex: &str, filters: &[&LogFilter]) -> bool {
    let Ok(bloom) = hex::decode(bloom_hex.trim_start_matches("0x")) else {
        return true;
    };

    filters.iter().any(|filter| {
        let address_possible = match &filter.address {
            AddressCriteria::Any | AddressCriteria::Child(_) => true,
            AddressCriteria::Single(a) => hex_item_in_bloom(&bloom, a),
            AddressCriteria::Many(addrs) => addrs.iter().any(|a| hex_item_in_bloom(&bloom, a)),
        };
        if !address_possible {
            return false;
        }
        filter.topics.iter().all(|criteria| match criteria {
            TopicCriteria::Any => true,
            TopicCriteria::Exact(t) => hex_item_in_bloom(&bloom, t),
            TopicCriteria::OneOf(ts) => ts.iter().any(|t| hex_item_in_bloom(&bloom, t)),
        })
    })
}

fn hex_item_in_bloom(bloom: &[u8], item_hex: &str) -> bool {
    match hex::decode(item_hex.trim_start_matches("0x")) {
        Ok(bytes) => bloom_contains(bloom, &bytes),
        // Undecodable constraints can't be ruled out.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a bloom containing exactly the given items.
    fn bloom_of(items: &[&[u8]]) -> Vec<u8> {
        let mut bloom = vec![0u8; BLOOM_BYTES];
        for item in items {
            let hash = keccak256(item);
            for i in 0..3 {
                let bit = (u16::from_be_bytes([hash[2 * i], hash[2 * i + 1]]) & 0x07ff) as usize;
                bloom[BLOOM_BYTES - 1 - bit / 8] |= 1 << (bit % 8);
            }
        }
        bloom
    }

    fn filter(address: AddressCriteria, topic0: TopicCriteria) -> LogFilter {
        LogFilter {
            chain_id: 1,
            from_block: 0,
            to_block: None,
            address,
            topics: [topic0, TopicCriteria::Any, TopicCriteria::Any, TopicCriteria::Any],
        }
    }

    #[test]
    fn membership_roundtrip() {
        let address = [0xaa; 20];
        let bloom = bloom_of(&[&address]);
        assert!(bloom_contains(&bloom, &address));
        assert!(!bloom_contains(&bloom, &[0xbb; 20]));
    }

    #[test]
    fn empty_bloom_rules_out_constrained_filter() {
        let bloom_hex = format!("0x{}", hex::encode([0u8; BLOOM_BYTES]));
        let f = filter(
            AddressCriteria::Single(format!("0x{}", hex::encode([0xaa; 20]))),
            TopicCriteria::Any,
        );
        assert!(!filters_might_match(&bloom_hex, &[&f]));
    }

    #[test]
    fn matching_address_and_topic_pass() {
        let address = [0xaa; 20];
        let topic = [0x77u8; 32];
        let bloom_hex = format!("0x{}", hex::encode(bloom_of(&[&address, &topic])));

        let f = filter(
            AddressCriteria::Single(format!("0x{}", hex::encode(address))),
            TopicCriteria::Exact(format!("0x{}", hex::encode(topic))),
        );
        assert!(filters_might_match(&bloom_hex, &[&f]));

        // Address present but required topic absent: AND across categories.
        let missing_topic = filter(
            AddressCriteria::Single(format!("0x{}", hex::encode(address))),
            TopicCriteria::Exact(format!("0x{}", hex::encode([0x11; 32]))),
        );
        assert!(!filters_might_match(&bloom_hex, &[&missing_topic]));
    }

    #[test]
    fn wildcards_and_child_filters_always_pass() {
        let bloom_hex = format!("0x{}", hex::encode([0u8; BLOOM_BYTES]));
        let unconstrained = filter(AddressCriteria::Any, TopicCriteria::Any);
        assert!(filters_might_match(&bloom_hex, &[&unconstrained]));
    }

    #[test]
    fn any_filter_matching_is_enough() {
        let address = [0xaa; 20];
        let bloom_hex = format!("0x{}", hex::encode(bloom_of(&[&address])));
        let miss = filter(
            AddressCriteria::Single(format!("0x{}", hex::encode([0xbb; 20]))),
            TopicCriteria::Any,
        );
        let hit = filter(
            AddressCriteria::Single(format!("0x{}", hex::encode(address))),
            TopicCriteria::Any,
        );
        assert!(filters_might_match(&bloom_hex, &[&miss, &hit]));
        assert!(!filters_might_match(&bloom_hex, &[&miss]));
    }
}
