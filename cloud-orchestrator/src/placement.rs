//! Node selection for new instances.
//!
//! Each eligible node scores one point for each of: enough free memory for
//! the requested specs, memory utilisation under 60%, and at least as many
//! CPUs as requested cores. The highest score wins; equal scores go to the
//! lexicographically smallest node name so placement is reproducible.

use cloud_provider::{NodeStats, Specs};
use tracing::debug;

const UTILISATION_LIMIT: f64 = 0.6;

pub fn score_node(node: &NodeStats, specs: &Specs) -> u32 {
    let mut score = 0;

    // specs are in MB, node stats in bytes
    let free = node.maxmem.saturating_sub(node.mem);
    if free > specs.memory.saturating_mul(1_000_000) {
        score += 1;
    }

    if node.maxmem > 0 && (node.mem as f64 / node.maxmem as f64) < UTILISATION_LIMIT {
        score += 1;
    }

    if node.maxcpu >= specs.cores {
        score += 1;
    }

    score
}

fn is_offline(node: &NodeStats) -> bool {
    node.status.as_deref().is_some_and(|s| s != "online")
}

/// Pick the node for an instance with `specs`, or `None` when no node is
/// eligible.
pub fn select_best_node(nodes: &[NodeStats], specs: &Specs, blacklist: &[String]) -> Option<String> {
    nodes
        .iter()
        .filter(|node| !blacklist.contains(&node.name))
        .filter(|node| !is_offline(node))
        .map(|node| (node.name.as_str(), score_node(node, specs)))
        .inspect(|(name, score)| debug!(node = name, score, "placement score"))
        .min_by(|(a_name, a_score), (b_name, b_score)| {
            b_score.cmp(a_score).then_with(|| a_name.cmp(b_name))
        })
        .map(|(name, _)| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1 << 30;

    fn node(name: &str, used: u64, total: u64, cpus: u32) -> NodeStats {
        NodeStats {
            name: name.to_string(),
            mem: used,
            maxmem: total,
            maxcpu: cpus,
            status: Some("online".to_string()),
        }
    }

    fn specs(cores: u32, memory: u64) -> Specs {
        Specs {
            cores,
            memory,
            disk_space: 10,
            swap: 0,
        }
    }

    #[test]
    fn test_blacklisted_node_is_never_chosen() {
        let nodes = vec![node("a", 8 * GB, 16 * GB, 4), node("b", 0, 64 * GB, 32)];
        let choice = select_best_node(&nodes, &specs(2, 1024), &["b".to_string()]);
        assert_eq!(choice.as_deref(), Some("a"));
    }

    #[test]
    fn test_empty_candidates_give_none() {
        assert_eq!(select_best_node(&[], &specs(1, 512), &[]), None);
        let nodes = vec![node("a", 0, 16 * GB, 4)];
        assert_eq!(select_best_node(&nodes, &specs(1, 512), &["a".to_string()]), None);
    }

    #[test]
    fn test_free_node_beats_busy_node() {
        // a: 8GB free of 16GB, 4 cpus -> 3 points; b: 2GB free of 16GB -> 2 points
        let nodes = vec![node("b", 14 * GB, 16 * GB, 4), node("a", 8 * GB, 16 * GB, 4)];
        assert_eq!(score_node(&nodes[0], &specs(2, 1024)), 2);
        assert_eq!(score_node(&nodes[1], &specs(2, 1024)), 2 + 1);
        assert_eq!(
            select_best_node(&nodes, &specs(2, 1024), &[]).as_deref(),
            Some("a")
        );
    }

    #[test]
    fn test_ties_break_on_name() {
        let nodes = vec![
            node("pve3", 0, 16 * GB, 8),
            node("pve1", 0, 16 * GB, 8),
            node("pve2", 0, 16 * GB, 8),
        ];
        assert_eq!(
            select_best_node(&nodes, &specs(2, 1024), &[]).as_deref(),
            Some("pve1")
        );
    }

    #[test]
    fn test_offline_nodes_are_skipped() {
        let mut down = node("pve1", 0, 64 * GB, 32);
        down.status = Some("offline".to_string());
        let nodes = vec![down, node("pve2", 12 * GB, 16 * GB, 2)];
        assert_eq!(
            select_best_node(&nodes, &specs(4, 8192), &[]).as_deref(),
            Some("pve2")
        );
    }
}
