//! Aggregation of drained samples into report rows.

use std::collections::HashMap;

use crate::event::Sample;

/// Merge duplicate pids (a drain can observe a pid twice across windows in
/// daemon mode) by OR-ing their masks, keeping pid order.
pub fn by_pid(samples: &[Sample]) -> Vec<Sample> {
    let mut merged: Vec<Sample> = Vec::with_capacity(samples.len());
    let mut index: HashMap<u32, usize> = HashMap::new();
    for sample in samples {
        match index.get(&sample.pid) {
            Some(&i) => merged[i].mask |= sample.mask,
            None => {
                index.insert(sample.pid, merged.len());
                merged.push(*sample);
            }
        }
    }
    merged
}

/// One pid namespace with the union of everything observed in it and in its
/// descendant namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceAggregate {
    pub ns: u32,
    pub mask: u64,
}

/// Aggregate per namespace: a namespace's mask includes every capability
/// requested by any process in it or below it, so a role authored for a
/// container covers the whole tree.
pub fn by_namespace(samples: &[Sample]) -> Vec<NamespaceAggregate> {
    let mut own_mask: HashMap<u32, u64> = HashMap::new();
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();

    for sample in samples {
        *own_mask.entry(sample.ns).or_insert(0) |= sample.mask;
        if sample.parent_ns != sample.ns {
            let siblings = children.entry(sample.parent_ns).or_default();
            if !siblings.contains(&sample.ns) {
                siblings.push(sample.ns);
            }
        }
    }

    let mut result: Vec<NamespaceAggregate> = own_mask
        .keys()
        .map(|&ns| NamespaceAggregate {
            ns,
            mask: subtree_mask(ns, &own_mask, &children),
        })
        .collect();
    result.sort_by_key(|aggregate| aggregate.ns);
    result
}

fn subtree_mask(ns: u32, own: &HashMap<u32, u64>, children: &HashMap<u32, Vec<u32>>) -> u64 {
    let mut mask = own.get(&ns).copied().unwrap_or(0);
    if let Some(kids) = children.get(&ns) {
        for &kid in kids {
            if kid != ns {
                mask |= subtree_mask(kid, own, children);
            }
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(pid: u32, ns: u32, parent_ns: u32, mask: u64) -> Sample {
        Sample {
            pid,
            ppid: 1,
            uid: 0,
            gid: 0,
            ns,
            parent_ns,
            mask,
        }
    }

    #[test]
    fn duplicate_pids_merge_masks() {
        let merged = by_pid(&[sample(7, 1, 1, 0b01), sample(7, 1, 1, 0b10)]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].mask, 0b11);
    }

    #[test]
    fn namespace_union_includes_descendants() {
        let samples = [
            sample(1, 100, 100, 0b001),
            sample(2, 200, 100, 0b010),
            sample(3, 300, 200, 0b100),
        ];
        let aggregates = by_namespace(&samples);
        let root = aggregates.iter().find(|a| a.ns == 100).unwrap();
        assert_eq!(root.mask, 0b111);
        let mid = aggregates.iter().find(|a| a.ns == 200).unwrap();
        assert_eq!(mid.mask, 0b110);
        let leaf = aggregates.iter().find(|a| a.ns == 300).unwrap();
        assert_eq!(leaf.mask, 0b100);
    }

    #[test]
    fn zero_mask_presence_is_preserved() {
        let merged = by_pid(&[sample(9, 1, 1, 0)]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].mask, 0);
    }
}
