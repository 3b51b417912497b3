//! Dirty-state recomputation: decides which files are out of date before
//! and during a build, loads previously discovered dependencies from the
//! journals, and loads dyndep files when they are already up to date.

use crate::db::{BuildLog, DepsLog};
use crate::depfile;
use crate::dyndep::{self, DyndepFile};
use crate::fs::{DiskInterface, MTime, ReadResult};
use crate::graph::{EdgeId, FileId, Graph, VisitMark};
use crate::scanner::Scanner;
use std::collections::VecDeque;

pub struct DependencyScan<'a> {
    disk: &'a dyn DiskInterface,
    build_log: BuildLog,
    deps_log: DepsLog,
    /// Only consider existence, not timestamps, when judging outputs.
    skip_check_timestamp: bool,
}

impl<'a> DependencyScan<'a> {
    pub fn new(
        disk: &'a dyn DiskInterface,
        build_log: BuildLog,
        deps_log: DepsLog,
        skip_check_timestamp: bool,
    ) -> Self {
        DependencyScan {
            disk,
            build_log,
            deps_log,
            skip_check_timestamp,
        }
    }

    pub fn disk(&self) -> &dyn DiskInterface {
        self.disk
    }

    pub fn build_log(&self) -> &BuildLog {
        &self.build_log
    }

    pub fn build_log_mut(&mut self) -> &mut BuildLog {
        &mut self.build_log
    }

    pub fn deps_log_mut(&mut self) -> &mut DepsLog {
        &mut self.deps_log
    }

    fn stat_if_necessary(&self, graph: &mut Graph, id: FileId) -> anyhow::Result<()> {
        if graph.file(id).mtime == MTime::Unknown {
            let mtime = self.disk.stat(&graph.file(id).name)?;
            graph.file_mut(id).mtime = mtime;
        }
        Ok(())
    }

    /// Recompute the dirty state of `node` and everything it transitively
    /// depends on.  Validation targets encountered along the way are scanned
    /// too and reported to the caller for promotion to top-level targets.
    pub fn recompute_dirty(
        &self,
        graph: &mut Graph,
        node: FileId,
        validations: &mut Vec<FileId>,
    ) -> anyhow::Result<()> {
        let mut queue = VecDeque::new();
        queue.push_back(node);
        while let Some(node) = queue.pop_front() {
            let mut stack = Vec::new();
            let mut new_validations = Vec::new();
            self.recompute_node_dirty(graph, node, &mut stack, &mut new_validations)?;
            queue.extend(new_validations.iter().copied());
            validations.extend(new_validations);
        }
        Ok(())
    }

    fn recompute_node_dirty(
        &self,
        graph: &mut Graph,
        node: FileId,
        stack: &mut Vec<FileId>,
        validations: &mut Vec<FileId>,
    ) -> anyhow::Result<()> {
        let edge = match graph.file(node).in_edge {
            None => {
                // Leaf: a source file (or a discovered dep with no producer).
                // It is dirty when missing; whether that is fatal is decided
                // when the plan walks to it.
                self.stat_if_necessary(graph, node)?;
                let missing = graph.file(node).mtime.is_missing();
                graph.file_mut(node).dirty = missing;
                return Ok(());
            }
            Some(edge) => edge,
        };

        match graph.edge(edge).mark {
            VisitMark::Done => return Ok(()),
            VisitMark::InStack => return Err(self.cycle_error(graph, edge, stack)),
            VisitMark::None => {}
        }
        graph.edge_mut(edge).mark = VisitMark::InStack;
        stack.push(node);

        // A dyndep file must be brought up to date before its info can be
        // trusted; if it already is, load it now so the input walk below
        // sees the discovered dependencies.
        if let Some(dd) = graph.edge(edge).dyndep {
            if graph.file(dd).dyndep_pending {
                self.recompute_node_dirty(graph, dd, stack, validations)?;
                let dd_ready = match graph.file(dd).in_edge {
                    None => true,
                    Some(producer) => graph.edge(producer).outputs_ready,
                };
                if dd_ready && !graph.file(dd).mtime.is_missing() {
                    self.load_dyndeps(graph, dd)?;
                }
            }
        }

        let mut dirty = false;

        if !graph.edge(edge).deps_loaded {
            graph.edge_mut(edge).deps_loaded = true;
            if !self.load_deps(graph, edge)? {
                // No usable record of discovered deps: rebuild to get one.
                graph.edge_mut(edge).deps_missing = true;
                dirty = true;
            }
        }

        validations.extend(graph.edge(edge).validations.iter().copied());

        for i in 0..graph.edge(edge).ins.ids.len() {
            let input = graph.edge(edge).ins.ids[i];
            self.recompute_node_dirty(graph, input, stack, validations)?;
            let order_only =
                i >= graph.edge(edge).ins.ids.len() - graph.edge(edge).ins.order_only;
            if !order_only && graph.file(input).dirty {
                dirty = true;
            }
        }

        for i in 0..graph.edge(edge).outs.ids.len() {
            let output = graph.edge(edge).outs.ids[i];
            self.stat_if_necessary(graph, output)?;
        }
        if !dirty {
            let most_recent = graph.most_recent_input(edge);
            dirty = self.recompute_outputs_dirty(graph, edge, most_recent)?;
        }

        for i in 0..graph.edge(edge).outs.ids.len() {
            let output = graph.edge(edge).outs.ids[i];
            graph.file_mut(output).dirty = dirty;
        }
        if !dirty {
            graph.edge_mut(edge).outputs_ready = true;
        }

        graph.edge_mut(edge).mark = VisitMark::Done;
        stack.pop();
        Ok(())
    }

    fn cycle_error(&self, graph: &Graph, edge: EdgeId, stack: &[FileId]) -> anyhow::Error {
        let start = stack
            .iter()
            .position(|&n| graph.file(n).in_edge == Some(edge))
            .unwrap_or(0);
        let mut names: Vec<&str> = stack[start..]
            .iter()
            .map(|&n| graph.file(n).name.as_str())
            .collect();
        names.push(names[0]);
        anyhow::anyhow!("dependency cycle: {}", names.join(" -> "))
    }

    /// Fold previously discovered dependencies into the edge's implicit
    /// inputs.  Returns false when there is no usable record, which dirties
    /// the edge so a fresh record gets produced.
    fn load_deps(&self, graph: &mut Graph, edge: EdgeId) -> anyhow::Result<bool> {
        if graph.edge(edge).deps.is_some() {
            let output = graph.edge(edge).outs.ids[0];
            self.stat_if_necessary(graph, output)?;
            let record = match self.deps_log.lookup(&graph.file(output).name) {
                None => return Ok(false),
                Some(record) => record,
            };
            // A record older than the output predates its last rebuild.
            if graph.file(output).mtime.nanos() > record.mtime {
                return Ok(false);
            }
            let deps: Vec<String> = record.deps.clone();
            self.add_discovered_inputs(graph, edge, &deps);
            return Ok(true);
        }

        if let Some(depfile_path) = graph.edge(edge).depfile.clone() {
            let mut content = match self.disk.read_file(&depfile_path)? {
                ReadResult::Okay(bytes) => bytes,
                ReadResult::NotFound => return Ok(false),
            };
            content.push(0);
            let mut scanner = Scanner::new(&content);
            let parsed = depfile::parse(&mut scanner)
                .map_err(|err| anyhow::anyhow!(scanner.format_parse_error(&depfile_path, err)))?;
            let primary = graph.file(graph.edge(edge).outs.ids[0]).name.clone();
            let deps: Vec<String> = match parsed.get(primary.as_str()) {
                Some(deps) => deps.iter().map(|d| crate::canon::canon_path(*d)).collect(),
                None => anyhow::bail!(
                    "expected depfile '{}' to mention '{}'",
                    depfile_path,
                    primary
                ),
            };
            self.add_discovered_inputs(graph, edge, &deps);
            return Ok(true);
        }

        Ok(true)
    }

    fn add_discovered_inputs(&self, graph: &mut Graph, edge: EdgeId, deps: &[String]) {
        for dep in deps {
            let id = graph.file_id(dep.clone());
            graph.file_mut(id).generated_by_dep_loader = true;
            if !graph.edge(edge).ins.ids.contains(&id) {
                graph.edge_mut(edge).ins.add_implicit(id);
                graph.file_mut(id).out_edges.push(edge);
            }
        }
    }

    /// Whether any output of `edge` is out of date relative to
    /// `most_recent_input`.  Pure with respect to dirty flags; shared by the
    /// scan and by restat cleaning.
    pub fn recompute_outputs_dirty(
        &self,
        graph: &mut Graph,
        edge: EdgeId,
        most_recent_input: Option<FileId>,
    ) -> anyhow::Result<bool> {
        for i in 0..graph.edge(edge).outs.ids.len() {
            let output = graph.edge(edge).outs.ids[i];
            self.stat_if_necessary(graph, output)?;
            if self.output_dirty(graph, edge, output, most_recent_input) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn output_dirty(
        &self,
        graph: &Graph,
        edge: EdgeId,
        output: FileId,
        most_recent_input: Option<FileId>,
    ) -> bool {
        let mtime = graph.file(output).mtime;
        if graph.edge(edge).is_phony() {
            // Phony edges don't write outputs; they are dirty only when used
            // to alias a missing file.
            return graph.edge(edge).ins.ids.is_empty() && mtime.is_missing();
        }
        if mtime.is_missing() {
            return true;
        }
        if self.skip_check_timestamp {
            return false;
        }
        if let Some(input) = most_recent_input {
            let input_mtime = match graph.file(input).mtime {
                MTime::Stamp(n) => n,
                MTime::Missing | MTime::Unknown => 0,
            };
            let mut output_mtime = mtime.nanos();
            if output_mtime < input_mtime && graph.edge(edge).restat {
                // A restat rule may have deliberately left the output alone;
                // the journal remembers when it was last really produced.
                if let Some(recorded) = self.build_log.recorded_mtime(&graph.file(output).name)
                {
                    output_mtime = recorded.nanos();
                }
            }
            if output_mtime < input_mtime {
                return true;
            }
        }
        false
    }

    /// Load the dyndep file `node` and fold its discovered dependencies into
    /// the graph.
    pub fn load_dyndeps(&self, graph: &mut Graph, node: FileId) -> anyhow::Result<DyndepFile> {
        let name = graph.file(node).name.clone();
        let content = match self.disk.read_file(&name)? {
            ReadResult::Okay(bytes) => bytes,
            ReadResult::NotFound => anyhow::bail!("dyndep file '{}' does not exist", name),
        };
        dyndep::load(graph, node, content)
    }
}
