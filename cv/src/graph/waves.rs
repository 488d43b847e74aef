//! Dependency layering shared by artifacts, tasks and gates

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::{ExecError, ExecResult};

type Edges<'a> = BTreeMap<&'a str, BTreeSet<&'a str>>;

/// Kahn layering into waves
///
/// Each wave holds every node whose dependencies all sit in earlier waves,
/// sorted by id. Dependencies on ids outside the node set count as already
/// satisfied, which is what a resumed run needs when completed tasks are left
/// out. A remainder that never becomes ready is reported as a cycle.
pub fn layer_waves<'a, I>(nodes: I) -> ExecResult<Vec<Vec<String>>>
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let all: Edges<'a> = nodes
        .into_iter()
        .map(|(id, deps)| (id, deps.iter().map(String::as_str).collect()))
        .collect();

    let mut remaining: Edges<'a> = all
        .iter()
        .map(|(id, deps)| (*id, deps.iter().copied().filter(|d| all.contains_key(d)).collect()))
        .collect();

    let mut waves = Vec::new();
    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();

        if ready.is_empty() {
            let cycle = find_cycle(&remaining).unwrap_or_else(|| remaining.keys().map(|s| s.to_string()).collect());
            return Err(ExecError::CyclicDependency { cycle });
        }

        for id in &ready {
            remaining.remove(id);
        }
        for deps in remaining.values_mut() {
            for id in &ready {
                deps.remove(id);
            }
        }
        waves.push(ready.into_iter().map(String::from).collect());
    }
    Ok(waves)
}

/// First cycle found by depth-first search, as `a -> b -> ... -> a`
pub(crate) fn find_cycle(edges: &Edges<'_>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut path = Vec::new();

    for &node in edges.keys() {
        if !visited.contains(node)
            && let Some(cycle) = cycle_dfs(node, edges, &mut visited, &mut path)
        {
            return Some(cycle);
        }
    }
    None
}

fn cycle_dfs<'a>(
    node: &'a str,
    edges: &Edges<'a>,
    visited: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    path.push(node);

    if let Some(deps) = edges.get(node) {
        for &dep in deps {
            if let Some(start) = path.iter().position(|p| *p == dep) {
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
            if !visited.contains(dep)
                && edges.contains_key(dep)
                && let Some(cycle) = cycle_dfs(dep, edges, visited, path)
            {
                return Some(cycle);
            }
        }
    }

    path.pop();
    None
}
