//! The build graph: files, the edges that produce them, and pools.
//!
//! Files and edges live in arenas and refer to each other by id, so the
//! plan and the scan can hold ids without entangling lifetimes.  The graph
//! is constructed up front through `file_id`/`add_pool`/`add_edge`; the only
//! mid-build mutation is dyndep application, which adds discovered implicit
//! inputs and outputs to existing edges.

use crate::densemap::{self, DenseMap};
use crate::fs::MTime;
use hashbrown::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);

impl densemap::Index for FileId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for FileId {
    fn from(u: usize) -> FileId {
        FileId(u as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(u32);

impl densemap::Index for EdgeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for EdgeId {
    fn from(u: usize) -> EdgeId {
        EdgeId(u as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u32);

impl densemap::Index for PoolId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for PoolId {
    fn from(u: usize) -> PoolId {
        PoolId(u as u32)
    }
}

/// A file tracked by the graph, produced by at most one edge.
pub struct File {
    pub name: String,
    pub mtime: MTime,
    pub dirty: bool,
    /// The file provides dyndep info that has not been loaded yet.
    pub dyndep_pending: bool,
    /// The file was first seen in discovered-dependency data rather than in
    /// the constructed graph; a missing one is not a hard error.
    pub generated_by_dep_loader: bool,
    pub in_edge: Option<EdgeId>,
    pub out_edges: Vec<EdgeId>,
}

/// Traversal state used by the dirty scan for cycle detection, and reset by
/// the dyndep refresh so dependents can be revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisitMark {
    #[default]
    None,
    InStack,
    Done,
}

/// How discovered dependencies are extracted after the command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepsStyle {
    /// Read and parse a Makefile-style depfile written by the command.
    Gcc,
    /// Filter `/showIncludes` lines out of the command's output.
    Msvc,
}

#[derive(Debug, Clone)]
pub struct RspFile {
    pub path: String,
    pub content: String,
}

/// Edge inputs, ordered explicit then implicit then order-only.
pub struct EdgeIns {
    pub ids: Vec<FileId>,
    pub implicit: usize,
    pub order_only: usize,
}

impl EdgeIns {
    pub fn explicit(ids: Vec<FileId>) -> Self {
        EdgeIns {
            ids,
            implicit: 0,
            order_only: 0,
        }
    }

    pub fn new(ids: Vec<FileId>, implicit: usize, order_only: usize) -> Self {
        assert!(implicit + order_only <= ids.len());
        EdgeIns {
            ids,
            implicit,
            order_only,
        }
    }

    /// Inputs that affect dirtiness: everything but the order-only tail.
    pub fn non_order_only(&self) -> &[FileId] {
        &self.ids[..self.ids.len() - self.order_only]
    }

    /// Insert a discovered input at the end of the implicit section.
    pub fn add_implicit(&mut self, id: FileId) {
        let pos = self.ids.len() - self.order_only;
        self.ids.insert(pos, id);
        self.implicit += 1;
    }
}

/// Edge outputs; discovered implicit outputs are appended at the end.
pub struct EdgeOuts {
    pub ids: Vec<FileId>,
    pub implicit: usize,
}

impl EdgeOuts {
    pub fn explicit(ids: Vec<FileId>) -> Self {
        EdgeOuts { ids, implicit: 0 }
    }
}

/// A producing command instantiation.  `cmdline` of None marks a phony
/// edge, a pure grouping node that never reaches the command runner.
pub struct Edge {
    pub rule: String,
    pub cmdline: Option<String>,
    pub desc: Option<String>,
    pub ins: EdgeIns,
    pub outs: EdgeOuts,
    /// Targets that must be brought up to date whenever this edge is, but
    /// that this edge does not depend on.
    pub validations: Vec<FileId>,
    pub pool: PoolId,
    pub depfile: Option<String>,
    pub rspfile: Option<RspFile>,
    pub deps: Option<DepsStyle>,
    pub msvc_deps_prefix: Option<String>,
    pub dyndep: Option<FileId>,
    pub restat: bool,
    pub generator: bool,
    pub outputs_ready: bool,
    /// Discovered-dependency info could not be loaded; the edge is dirty and
    /// excluded from restat cleaning.
    pub deps_missing: bool,
    /// Discovered-dependency info has been loaded (or attempted) this run.
    pub deps_loaded: bool,
    pub mark: VisitMark,
    pub critical_path_weight: i64,
    /// Mtime of the lock file stamped when the command started, used as the
    /// journal mtime unless restat observes newer outputs.
    pub command_start_time: MTime,
}

impl Edge {
    pub fn new(rule: impl Into<String>) -> Edge {
        Edge {
            rule: rule.into(),
            cmdline: None,
            desc: None,
            ins: EdgeIns::explicit(Vec::new()),
            outs: EdgeOuts::explicit(Vec::new()),
            validations: Vec::new(),
            pool: Graph::DEFAULT_POOL,
            depfile: None,
            rspfile: None,
            deps: None,
            msvc_deps_prefix: None,
            dyndep: None,
            restat: false,
            generator: false,
            outputs_ready: false,
            deps_missing: false,
            deps_loaded: false,
            mark: VisitMark::None,
            // Below any computed weight, so the critical-path backflow
            // relaxes even zero-weight (phony) paths on first visit.
            critical_path_weight: -1,
            command_start_time: MTime::Unknown,
        }
    }

    pub fn is_phony(&self) -> bool {
        self.cmdline.is_none()
    }

    pub fn use_console(&self) -> bool {
        self.pool == Graph::CONSOLE_POOL
    }
}

/// A named concurrency domain.  Depth 0 means unlimited.
pub struct Pool {
    pub name: String,
    pub depth: usize,
}

pub struct Graph {
    pub files: DenseMap<FileId, File>,
    pub edges: DenseMap<EdgeId, Edge>,
    pub pools: DenseMap<PoolId, Pool>,
    file_by_name: HashMap<String, FileId>,
    pool_by_name: HashMap<String, PoolId>,
    /// Directory for build byproducts (the lock file); empty means the cwd.
    pub build_dir: Option<String>,
}

impl Graph {
    pub const DEFAULT_POOL: PoolId = PoolId(0);
    pub const CONSOLE_POOL: PoolId = PoolId(1);

    pub fn new() -> Graph {
        let mut graph = Graph {
            files: DenseMap::new(),
            edges: DenseMap::new(),
            pools: DenseMap::new(),
            file_by_name: HashMap::new(),
            pool_by_name: HashMap::new(),
            build_dir: None,
        };
        graph.pools.push(Pool {
            name: String::new(),
            depth: 0,
        });
        graph.pools.push(Pool {
            name: "console".to_string(),
            depth: 1,
        });
        graph.pool_by_name.insert("console".to_string(), Graph::CONSOLE_POOL);
        graph
    }

    /// Intern a path, creating the file if unseen.
    pub fn file_id(&mut self, name: impl Into<String>) -> FileId {
        let name = name.into();
        match self.file_by_name.get(&name) {
            Some(&id) => id,
            None => {
                let id = self.files.push(File {
                    name: name.clone(),
                    mtime: MTime::Unknown,
                    dirty: false,
                    dyndep_pending: false,
                    generated_by_dep_loader: false,
                    in_edge: None,
                    out_edges: Vec::new(),
                });
                self.file_by_name.insert(name, id);
                id
            }
        }
    }

    pub fn lookup_file(&self, name: &str) -> Option<FileId> {
        self.file_by_name.get(name).copied()
    }

    pub fn file(&self, id: FileId) -> &File {
        self.files.get(id)
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut File {
        self.files.get_mut(id)
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        self.edges.get(id)
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        self.edges.get_mut(id)
    }

    pub fn pool(&self, id: PoolId) -> &Pool {
        self.pools.get(id)
    }

    pub fn add_pool(&mut self, name: impl Into<String>, depth: usize) -> anyhow::Result<PoolId> {
        let name = name.into();
        if self.pool_by_name.contains_key(&name) {
            anyhow::bail!("duplicate pool '{}'", name);
        }
        let id = self.pools.push(Pool {
            name: name.clone(),
            depth,
        });
        self.pool_by_name.insert(name, id);
        Ok(id)
    }

    pub fn lookup_pool(&self, name: &str) -> Option<PoolId> {
        self.pool_by_name.get(name).copied()
    }

    /// Add a fully described edge, wiring producer and consumer links.
    pub fn add_edge(&mut self, edge: Edge) -> anyhow::Result<EdgeId> {
        if edge.outs.ids.is_empty() {
            anyhow::bail!("edge '{}' has no outputs", edge.rule);
        }
        if let Some(dd) = edge.dyndep {
            if !edge.ins.ids.contains(&dd) {
                anyhow::bail!(
                    "dyndep file '{}' is not an input of the edge",
                    self.file(dd).name
                );
            }
            self.files.get_mut(dd).dyndep_pending = true;
        }
        let id = self.edges.next_id();
        for &out in &edge.outs.ids {
            let file = self.files.get_mut(out);
            if file.in_edge.is_some() {
                anyhow::bail!("multiple rules generate '{}'", file.name);
            }
            file.in_edge = Some(id);
        }
        for &input in &edge.ins.ids {
            self.files.get_mut(input).out_edges.push(id);
        }
        self.edges.push(edge);
        Ok(id)
    }

    /// Whether every input's producing edge (if any) has finished.
    /// Order-only inputs count: they must exist before the edge runs even
    /// though they do not dirty it.
    pub fn all_inputs_ready(&self, id: EdgeId) -> bool {
        self.edge(id).ins.ids.iter().all(|&input| {
            match self.file(input).in_edge {
                None => true,
                Some(producer) => self.edge(producer).outputs_ready,
            }
        })
    }

    /// The newest non-order-only input, for output dirtiness comparisons.
    pub fn most_recent_input(&self, id: EdgeId) -> Option<FileId> {
        self.edge(id)
            .ins
            .non_order_only()
            .iter()
            .copied()
            .max_by_key(|&input| match self.file(input).mtime {
                MTime::Unknown => 0,
                MTime::Missing => 0,
                MTime::Stamp(n) => n,
            })
    }
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}
