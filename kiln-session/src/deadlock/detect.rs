use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::extract::DependencyExtractor;
use super::{Deadlock, DeadlockKind, ItemId, ItemState, WorkItem};

/// Scan `items` for circular dependencies, shared resources and blocked chains.
///
/// Only references to items inside the set count. At most one circular
/// deadlock is reported (the first cycle found, visiting items by id).
pub fn detect_deadlocks(items: &[WorkItem], extractor: &dyn DependencyExtractor) -> Vec<Deadlock> {
    let ids: BTreeSet<ItemId> = items.iter().map(|i| i.id).collect();
    let graph: BTreeMap<ItemId, Vec<ItemId>> = items
        .iter()
        .map(|item| {
            let deps = extractor
                .dependencies(item)
                .into_iter()
                .filter(|d| ids.contains(d))
                .collect();
            (item.id, deps)
        })
        .collect();

    let mut found = Vec::new();
    if let Some(cycle) = find_cycle(&graph) {
        let path = cycle
            .iter()
            .chain(cycle.first())
            .map(|id| format!("#{}", id))
            .collect::<Vec<_>>()
            .join(" -> ");
        found.push(Deadlock {
            kind: DeadlockKind::Circular,
            items: cycle,
            resource: None,
            description: format!("Circular dependency: {}", path),
        });
    }

    let mut claims: BTreeMap<String, Vec<ItemId>> = BTreeMap::new();
    for item in items {
        for resource in extractor.resources(item) {
            claims.entry(resource).or_default().push(item.id);
        }
    }
    for (resource, mut claimants) in claims {
        claimants.sort_unstable();
        claimants.dedup();
        if claimants.len() > 1 {
            found.push(Deadlock {
                kind: DeadlockKind::Resource,
                description: format!(
                    "{} is claimed by {} items",
                    resource,
                    claimants.len()
                ),
                items: claimants,
                resource: Some(resource),
            });
        }
    }

    for item in items.iter().filter(|i| i.state == ItemState::Blocked) {
        let deps = graph.get(&item.id).cloned().unwrap_or_default();
        if deps.is_empty() {
            continue;
        }
        let waiting_on = deps
            .iter()
            .map(|id| format!("#{}", id))
            .collect::<Vec<_>>()
            .join(", ");
        let mut involved = vec![item.id];
        involved.extend(deps);
        found.push(Deadlock {
            kind: DeadlockKind::Dependency,
            items: involved,
            resource: None,
            description: format!("#{} is blocked waiting on {}", item.id, waiting_on),
        });
    }

    found
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search with an explicit recursion stack.
fn find_cycle(graph: &BTreeMap<ItemId, Vec<ItemId>>) -> Option<Vec<ItemId>> {
    let mut marks: HashMap<ItemId, Mark> = HashMap::new();

    for &root in graph.keys() {
        if marks.contains_key(&root) {
            continue;
        }
        // (node, index of next edge to follow)
        let mut stack: Vec<(ItemId, usize)> = vec![(root, 0)];
        marks.insert(root, Mark::Visiting);

        while let Some((node, next)) = stack.last().copied() {
            let edges = graph.get(&node).map(Vec::as_slice).unwrap_or(&[]);
            match edges.get(next) {
                Some(&target) => {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    match marks.get(&target) {
                        Some(Mark::Visiting) => {
                            let start = stack.iter().position(|(n, _)| *n == target)?;
                            return Some(stack[start..].iter().map(|(n, _)| *n).collect());
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(target, Mark::Visiting);
                            stack.push((target, 0));
                        }
                    }
                }
                None => {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                }
            }
        }
    }
    None
}
