//! Database dependency graph
//!
//! The store is made of a fixed set of databases. Some depend on others at
//! runtime: the trees codec resolves frame names through the dictionaries
//! cache, so dictionaries must be open before trees and must outlive every
//! flush of the trees cache. Open and close order are derived from these
//! edges instead of being maintained by hand.

use std::collections::HashMap;

use profstore_core::{Result, StoreError};

/// The databases a store is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatabaseKind {
    /// Root namespace; backs the label index and schema metadata
    Main,
    /// Symbol tables used by the trees codec
    Dictionaries,
    /// Label value → segment key sets
    Dimensions,
    /// Per-series segment metadata
    Segments,
    /// Aggregated call trees
    Trees,
}

impl DatabaseKind {
    /// Every kind, in declaration order
    pub const ALL: [DatabaseKind; 5] = [
        DatabaseKind::Main,
        DatabaseKind::Dictionaries,
        DatabaseKind::Dimensions,
        DatabaseKind::Segments,
        DatabaseKind::Trees,
    ];

    /// Order used for reporting (disk usage, cache stats, metrics)
    pub const REPORT_ORDER: [DatabaseKind; 5] = [
        DatabaseKind::Main,
        DatabaseKind::Dimensions,
        DatabaseKind::Segments,
        DatabaseKind::Dictionaries,
        DatabaseKind::Trees,
    ];

    /// Database name, also its directory name
    pub fn name(self) -> &'static str {
        match self {
            DatabaseKind::Main => "main",
            DatabaseKind::Dictionaries => "dicts",
            DatabaseKind::Dimensions => "dimensions",
            DatabaseKind::Segments => "segments",
            DatabaseKind::Trees => "trees",
        }
    }

    /// Key prefix; main owns the whole keyspace
    pub fn prefix(self) -> &'static str {
        match self {
            DatabaseKind::Main => "",
            DatabaseKind::Dictionaries => "d:",
            DatabaseKind::Dimensions => "i:",
            DatabaseKind::Segments => "s:",
            DatabaseKind::Trees => "t:",
        }
    }

    /// Databases that must be open while this one is in use
    pub fn depends_on(self) -> &'static [DatabaseKind] {
        match self {
            DatabaseKind::Trees => &[DatabaseKind::Dictionaries],
            _ => &[],
        }
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Directed acyclic graph over database kinds.
///
/// An edge `(a, b)` means `a` depends on `b`.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<DatabaseKind>,
    edges: Vec<(DatabaseKind, DatabaseKind)>,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::from_kinds(&DatabaseKind::ALL)
    }
}

impl DependencyGraph {
    /// Graph over `kinds` using their declared dependencies
    pub fn from_kinds(kinds: &[DatabaseKind]) -> Self {
        let edges = kinds
            .iter()
            .flat_map(|&k| k.depends_on().iter().map(move |&d| (k, d)))
            .filter(|(_, d)| kinds.contains(d))
            .collect();
        Self::with_edges(kinds, edges)
    }

    /// Graph with explicit edges; edges naming unknown nodes are ignored
    pub fn with_edges(kinds: &[DatabaseKind], edges: Vec<(DatabaseKind, DatabaseKind)>) -> Self {
        let edges = edges
            .into_iter()
            .filter(|(a, b)| kinds.contains(a) && kinds.contains(b))
            .collect();
        Self {
            nodes: kinds.to_vec(),
            edges,
        }
    }

    fn dependencies(&self, kind: DatabaseKind) -> impl Iterator<Item = DatabaseKind> + '_ {
        self.edges
            .iter()
            .filter(move |(a, _)| *a == kind)
            .map(|(_, b)| *b)
    }

    fn dependents(&self, kind: DatabaseKind) -> impl Iterator<Item = DatabaseKind> + '_ {
        self.edges
            .iter()
            .filter(move |(_, b)| *b == kind)
            .map(|(a, _)| *a)
    }

    /// Topological order; ties keep node order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` if the edges form a cycle.
    pub fn open_order(&self) -> Result<Vec<DatabaseKind>> {
        let mut order: Vec<DatabaseKind> = Vec::with_capacity(self.nodes.len());
        while order.len() < self.nodes.len() {
            let next = self.nodes.iter().copied().find(|&n| {
                !order.contains(&n) && self.dependencies(n).all(|d| order.contains(&d))
            });
            match next {
                Some(n) => order.push(n),
                None => {
                    return Err(StoreError::config(
                        "database dependencies contain a cycle",
                    ))
                }
            }
        }
        Ok(order)
    }

    /// Close order as layers; every database in a layer may close
    /// concurrently, and a layer starts only after the previous one finished.
    ///
    /// A database lands one layer after the last of its dependents, so
    /// nothing is closed while something depending on it is still open.
    pub fn close_layers(&self) -> Result<Vec<Vec<DatabaseKind>>> {
        let order = self.open_order()?;
        let mut level: HashMap<DatabaseKind, usize> = HashMap::new();
        for &n in order.iter().rev() {
            let l = self
                .dependents(n)
                .filter_map(|d| level.get(&d))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(n, l);
        }

        let depth = level.values().copied().max().map_or(0, |m| m + 1);
        let mut layers = vec![Vec::new(); depth];
        for &n in &self.nodes {
            if let Some(&l) = level.get(&n) {
                layers[l].push(n);
            }
        }
        Ok(layers)
    }
}
