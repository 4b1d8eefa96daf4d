//! Graph lookup for resuming runs
//!
//! Checkpoints name their graph by id; the arbiter resolves the id to a
//! live [`Graph`] through this trait. [`GraphRegistry`] is the plain
//! map-backed implementation, populated at startup.

use parking_lot::RwLock;
use spice_core::Graph;
use std::collections::HashMap;
use std::sync::Arc;

/// Locates the graph a checkpoint belongs to
pub trait GraphProvider: Send + Sync {
    fn graph(&self, graph_id: &str) -> Option<Arc<Graph>>;
}

/// Map-backed [`GraphProvider`]
#[derive(Default)]
pub struct GraphRegistry {
    graphs: RwLock<HashMap<String, Arc<Graph>>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, graph: Arc<Graph>) {
        self.graphs.write().insert(graph.id.clone(), graph);
    }

    pub fn len(&self) -> usize {
        self.graphs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.read().is_empty()
    }
}

impl GraphProvider for GraphRegistry {
    fn graph(&self, graph_id: &str) -> Option<Arc<Graph>> {
        self.graphs.read().get(graph_id).cloned()
    }
}
