//! Predicate-guarded edges and deterministic edge selection
//!
//! Edges carry a priority (lower first), an optional condition over the
//! message (absent means always true), and a fallback flag. Selection is
//! deterministic: regular edges are tried before fallbacks, each partition
//! ordered by priority with registration order breaking ties.

use crate::message::Message;
use std::sync::Arc;

type EdgeConditionFn = dyn Fn(&Message) -> bool + Send + Sync;

/// Directed, guarded connection between two nodes
#[derive(Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// Lower priorities are considered first
    pub priority: i32,
    pub name: Option<String>,
    /// Fallback edges are only consulted when no regular edge matches
    pub is_fallback: bool,
    condition: Option<Arc<EdgeConditionFn>>,
}

impl Edge {
    /// Unconditional edge with default priority
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            priority: 0,
            name: None,
            is_fallback: false,
            condition: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn fallback(mut self) -> Self {
        self.is_fallback = true;
        self
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Whether the edge's guard holds (missing condition is always true)
    pub fn matches(&self, message: &Message) -> bool {
        self.condition.as_ref().map(|c| c(message)).unwrap_or(true)
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("priority", &self.priority)
            .field("name", &self.name)
            .field("is_fallback", &self.is_fallback)
            .field("has_condition", &self.condition.is_some())
            .finish()
    }
}

/// Pick the next edge out of `from` for the given message
///
/// Returns the first regular edge (by priority, then registration order)
/// whose condition holds, falling back to the first matching fallback edge,
/// or `None` when nothing matches.
pub fn select_edge<'a>(edges: &'a [Edge], from: &str, message: &Message) -> Option<&'a Edge> {
    let mut outgoing: Vec<&Edge> = edges.iter().filter(|e| e.from == from).collect();
    // Stable sort keeps registration order within equal priorities.
    outgoing.sort_by_key(|e| e.priority);

    outgoing
        .iter()
        .find(|e| !e.is_fallback && e.matches(message))
        .or_else(|| outgoing.iter().find(|e| e.is_fallback && e.matches(message)))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> Message {
        Message::new("x", "a")
    }

    #[test]
    fn test_priority_orders_selection() {
        let edges = vec![
            Edge::new("a", "low").with_priority(10),
            Edge::new("a", "high").with_priority(1),
        ];
        assert_eq!(select_edge(&edges, "a", &msg()).unwrap().to, "high");
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        let edges = vec![
            Edge::new("a", "first"),
            Edge::new("a", "second"),
        ];
        assert_eq!(select_edge(&edges, "a", &msg()).unwrap().to, "first");
    }

    #[test]
    fn test_condition_gates_regular_edges() {
        let edges = vec![
            Edge::new("a", "gated").with_condition(|m| m.get_data("go").is_some()),
            Edge::new("a", "open"),
        ];
        assert_eq!(select_edge(&edges, "a", &msg()).unwrap().to, "open");

        let ready = msg().with_data("go", true);
        assert_eq!(select_edge(&edges, "a", &ready).unwrap().to, "gated");
    }

    #[test]
    fn test_fallback_used_only_when_no_regular_matches() {
        let edges = vec![
            Edge::new("a", "rescue").fallback(),
            Edge::new("a", "normal").with_condition(|m| m.get_data("go").is_some()),
        ];
        assert_eq!(select_edge(&edges, "a", &msg()).unwrap().to, "rescue");

        let ready = msg().with_data("go", true);
        assert_eq!(select_edge(&edges, "a", &ready).unwrap().to, "normal");
    }

    #[test]
    fn test_no_edge_matches() {
        let edges = vec![
            Edge::new("a", "gated").with_condition(|_| false),
            Edge::new("other", "elsewhere"),
        ];
        assert!(select_edge(&edges, "a", &msg()).is_none());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let edges = vec![
            Edge::new("a", "b").with_priority(5),
            Edge::new("a", "c").with_priority(5),
            Edge::new("a", "d").fallback(),
        ];
        let message = msg();
        let first = select_edge(&edges, "a", &message).unwrap().to.clone();
        for _ in 0..10 {
            assert_eq!(select_edge(&edges, "a", &message).unwrap().to, first);
        }
    }
}
