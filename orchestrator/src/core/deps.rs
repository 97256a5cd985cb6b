//! Dependency edge validation and unblocking rules.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::TaskStatus;

/// Directed edge: `task_id` depends on `depends_on_task_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub task_id: String,
    pub depends_on_task_id: String,
}

impl DependencyEdge {
    pub fn new(task_id: impl Into<String>, depends_on_task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            depends_on_task_id: depends_on_task_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EdgeError {
    #[error("task {0} cannot depend on itself")]
    SelfReference(String),
    #[error("task {task_id} already depends on {depends_on_task_id}")]
    Duplicate {
        task_id: String,
        depends_on_task_id: String,
    },
    #[error("circular dependency: {}", path.join(" -> "))]
    Circular { path: Vec<String> },
}

/// Check that adding `task_id -> depends_on` keeps the graph acyclic.
///
/// Walks the whole graph, so `A -> B -> C` rejects `C -> A` as well as the
/// direct reverse edge.
pub fn validate_new_edge(
    edges: &[DependencyEdge],
    task_id: &str,
    depends_on: &str,
) -> Result<(), EdgeError> {
    if task_id == depends_on {
        return Err(EdgeError::SelfReference(task_id.to_string()));
    }
    if edges
        .iter()
        .any(|e| e.task_id == task_id && e.depends_on_task_id == depends_on)
    {
        return Err(EdgeError::Duplicate {
            task_id: task_id.to_string(),
            depends_on_task_id: depends_on.to_string(),
        });
    }
    if let Some(mut path) = find_path(edges, depends_on, task_id) {
        path.insert(0, task_id.to_string());
        return Err(EdgeError::Circular { path });
    }
    Ok(())
}

/// Breadth-first search along `depends_on` edges from `from` to `to`.
fn find_path(edges: &[DependencyEdge], from: &str, to: &str) -> Option<Vec<String>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.task_id.as_str())
            .or_default()
            .push(edge.depends_on_task_id.as_str());
    }

    let mut parent: HashMap<&str, &str> = HashMap::new();
    let mut seen: HashSet<&str> = HashSet::from([from]);
    let mut queue: VecDeque<&str> = VecDeque::from([from]);

    while let Some(node) = queue.pop_front() {
        if node == to {
            let mut path = vec![node.to_string()];
            let mut cursor = node;
            while let Some(&prev) = parent.get(cursor) {
                path.push(prev.to_string());
                cursor = prev;
            }
            path.reverse();
            return Some(path);
        }
        let Some(next) = adjacency.get(node) else {
            continue;
        };
        let mut next = next.clone();
        next.sort_unstable();
        for dep in next {
            if seen.insert(dep) {
                parent.insert(dep, node);
                queue.push_back(dep);
            }
        }
    }
    None
}

/// True when a backlog task has every dependency complete.
pub fn should_unblock(status: TaskStatus, dependency_statuses: &[TaskStatus]) -> bool {
    status == TaskStatus::Backlog && dependency_statuses.iter().all(|s| s.is_complete())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &[(&str, &str)]) -> Vec<DependencyEdge> {
        pairs
            .iter()
            .map(|(a, b)| DependencyEdge::new(*a, *b))
            .collect()
    }

    #[test]
    fn rejects_self_edge() {
        let err = validate_new_edge(&[], "a", "a").expect_err("self edge");
        assert_eq!(err, EdgeError::SelfReference("a".to_string()));
    }

    #[test]
    fn rejects_direct_reverse_edge() {
        let graph = edges(&[("a", "b")]);
        let err = validate_new_edge(&graph, "b", "a").expect_err("cycle");
        assert_eq!(
            err,
            EdgeError::Circular {
                path: vec!["b".to_string(), "a".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn rejects_multi_hop_cycle() {
        let graph = edges(&[("a", "b"), ("b", "c")]);
        let err = validate_new_edge(&graph, "c", "a").expect_err("cycle");
        assert!(matches!(err, EdgeError::Circular { ref path } if path.len() == 4));
        assert!(err.to_string().contains("c -> a -> b -> c"));
    }

    #[test]
    fn accepts_diamond() {
        let graph = edges(&[("a", "b"), ("a", "c"), ("b", "d")]);
        validate_new_edge(&graph, "c", "d").expect("diamond is acyclic");
    }

    #[test]
    fn rejects_duplicate() {
        let graph = edges(&[("a", "b")]);
        assert!(matches!(
            validate_new_edge(&graph, "a", "b"),
            Err(EdgeError::Duplicate { .. })
        ));
    }

    #[test]
    fn unblocks_only_when_all_dependencies_complete() {
        assert!(should_unblock(
            TaskStatus::Backlog,
            &[TaskStatus::Done, TaskStatus::Approved]
        ));
        assert!(!should_unblock(
            TaskStatus::Backlog,
            &[TaskStatus::Done, TaskStatus::InProgress]
        ));
        assert!(!should_unblock(TaskStatus::Ready, &[TaskStatus::Done]));
    }
}
