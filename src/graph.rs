//! The dependency graph: typed vertices for files, directories, generated
//! artifacts, and configuration entries, joined by depends-on edges.
//! Built once per invocation, then read-only.

use crate::densemap::{self, DenseMap};
use rustc_hash::FxHashMap;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct VertexId(u32);

impl densemap::Index for VertexId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for VertexId {
    fn from(u: usize) -> VertexId {
        VertexId(u as u32)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VertexKind {
    /// A plain input file (source or header); never built.
    File,
    /// A directory that must exist before its dependents are built.
    Directory,
    /// A generated intermediate file, e.g. an object file.
    Artifact,
    /// A persisted configuration entry, e.g. the chosen compiler.
    EnvEntry,
    /// The final linked/archived output.
    FinalOutput,
}

impl VertexKind {
    /// Whether an action runs when a vertex of this kind is stale.
    /// File and EnvEntry vertices are pure inputs.
    pub fn produces_action(self) -> bool {
        matches!(
            self,
            VertexKind::Directory | VertexKind::Artifact | VertexKind::FinalOutput
        )
    }
}

#[derive(Debug)]
pub struct Vertex {
    pub name: String,
    pub kind: VertexKind,
    /// Dependencies, in insertion order.
    deps: Vec<VertexId>,
    /// Reverse edges, maintained for the completion cascade.
    dependents: Vec<VertexId>,
}

#[derive(Debug)]
pub enum GraphError {
    /// A vertex was re-added under a different kind.
    ConflictingKind {
        name: String,
        have: VertexKind,
        want: VertexKind,
    },
    /// An edge endpoint was never added.
    UnknownVertex { name: String },
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphError::ConflictingKind { name, have, want } => write!(
                f,
                "{}: already in the graph as {:?}, cannot re-add as {:?}",
                name, have, want
            ),
            GraphError::UnknownVertex { name } => write!(f, "unknown vertex {:?}", name),
        }
    }
}
impl std::error::Error for GraphError {}

#[derive(Debug, Default)]
pub struct Graph {
    vertices: DenseMap<VertexId, Vertex>,
    by_name: FxHashMap<String, VertexId>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Add a vertex, or return the existing one if name and kind match.
    pub fn add_vertex(&mut self, name: &str, kind: VertexKind) -> Result<VertexId, GraphError> {
        if let Some(&id) = self.by_name.get(name) {
            let have = self.vertices[id].kind;
            if have != kind {
                return Err(GraphError::ConflictingKind {
                    name: name.to_string(),
                    have,
                    want: kind,
                });
            }
            return Ok(id);
        }
        let id = self.vertices.push(Vertex {
            name: name.to_string(),
            kind,
            deps: Vec::new(),
            dependents: Vec::new(),
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<VertexId> {
        self.by_name.get(name).copied()
    }

    /// Record that `dependent` depends on `dependency`.
    /// Duplicate edges collapse to one.
    pub fn add_edge(&mut self, dependent: VertexId, dependency: VertexId) {
        if self.vertices[dependent].deps.contains(&dependency) {
            return;
        }
        self.vertices[dependent].deps.push(dependency);
        self.vertices[dependency].dependents.push(dependent);
    }

    pub fn add_edge_by_name(&mut self, dependent: &str, dependency: &str) -> Result<(), GraphError> {
        let from = self.id_of(dependent)?;
        let to = self.id_of(dependency)?;
        self.add_edge(from, to);
        Ok(())
    }

    fn id_of(&self, name: &str) -> Result<VertexId, GraphError> {
        self.lookup(name).ok_or_else(|| GraphError::UnknownVertex {
            name: name.to_string(),
        })
    }

    pub fn vertex(&self, id: VertexId) -> &Vertex {
        &self.vertices[id]
    }

    /// The vertex's dependencies, in insertion order.
    pub fn deps(&self, id: VertexId) -> &[VertexId] {
        &self.vertices[id].deps
    }

    pub fn dependents(&self, id: VertexId) -> &[VertexId] {
        &self.vertices[id].dependents
    }

    pub fn next_id(&self) -> VertexId {
        self.vertices.next_id()
    }
}
