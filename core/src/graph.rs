use std::collections::{HashMap, HashSet};

use crate::error::{CoordError, Result};

/// Validate that the stream dependency graph stays acyclic after adding the
/// candidate stream's edges.
///
/// `graph` maps stream-id to its dependency list and must already include
/// the candidate edges. DFS with a visited set plus a recursion stack; any
/// back-edge reaching an ancestor is a cycle.
pub fn validate_stream_dependencies(
    graph: &HashMap<String, Vec<String>>,
    candidate: &str,
) -> Result<()> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: HashSet<&str> = HashSet::new();

    for start in graph.keys() {
        if !visited.contains(start.as_str()) {
            dfs(graph, start, &mut visited, &mut stack, candidate)?;
        }
    }
    Ok(())
}

fn dfs<'a>(
    graph: &'a HashMap<String, Vec<String>>,
    node: &'a str,
    visited: &mut HashSet<&'a str>,
    stack: &mut HashSet<&'a str>,
    candidate: &str,
) -> Result<()> {
    visited.insert(node);
    stack.insert(node);

    if let Some(deps) = graph.get(node) {
        for dep in deps {
            if stack.contains(dep.as_str()) {
                return Err(CoordError::stream_cycle(candidate));
            }
            if !visited.contains(dep.as_str()) {
                dfs(graph, dep, visited, stack, candidate)?;
            }
        }
    }

    stack.remove(node);
    Ok(())
}
