//! The build driver: walks targets into the plan, then alternates between
//! starting ready commands and reaping finished ones, feeding completions
//! back into the plan and the journals until the plan drains or the failure
//! budget runs out.

use crate::canon;
use crate::clparser;
use crate::depfile;
use crate::fs::{DiskInterface, MTime, ReadResult};
use crate::graph::{DepsStyle, EdgeId, FileId, Graph};
use crate::plan::{EdgeResult, Plan};
use crate::process::Termination;
use crate::runner::{
    default_label, CommandRunner, DryRunCommandRunner, RealCommandRunner, TaskDone,
};
use crate::scan::DependencyScan;
use crate::scanner::Scanner;
use crate::status::Status;
use crate::trace;
use hashbrown::HashMap;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

#[derive(Clone)]
pub struct BuildConfig {
    /// Hard upper bound on concurrent commands.
    pub parallelism: usize,
    /// Soft bound: when > 0, current system load eats into capacity.
    pub max_load_average: f64,
    /// Edge failures tolerated before the loop stops starting work.
    pub failures_allowed: usize,
    pub dry_run: bool,
    pub verbosity: Verbosity,
    /// Capture command output per subprocess (required for the banner).
    pub enable_bufferization: bool,
    /// Write per-rule log files and the failed-parts summary under logs_dir.
    pub logfiles_enabled: bool,
    pub logs_dir: String,
    pub skip_check_timestamp: bool,
    pub keep_rspfile: bool,
    pub keep_depfile: bool,
    /// Shortens rule names for failure reports and per-rule log names.
    pub label_fn: fn(&str) -> String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            parallelism: 1,
            max_load_average: 0.0,
            failures_allowed: 1,
            dry_run: false,
            verbosity: Verbosity::Normal,
            enable_bufferization: false,
            logfiles_enabled: false,
            logs_dir: "logs".to_string(),
            skip_check_timestamp: false,
            keep_rspfile: false,
            keep_depfile: false,
            label_fn: default_label,
        }
    }
}

const LOCK_FILE_NAME: &str = ".ninja_lock";

pub struct Builder<'a> {
    graph: &'a mut Graph,
    config: BuildConfig,
    plan: Plan,
    scan: DependencyScan<'a>,
    disk: &'a dyn DiskInterface,
    status: &'a mut dyn Status,
    runner: Option<Box<dyn CommandRunner + 'a>>,
    /// Start time (ms since build start) of each running edge.
    running_edges: HashMap<EdgeId, u64>,
    failed_edges: Vec<String>,
    /// Marker file whose mtime anchors journal records for this build.
    lock_file_path: String,
    start_time: Instant,
}

impl<'a> Builder<'a> {
    pub fn new(
        graph: &'a mut Graph,
        config: &BuildConfig,
        scan: DependencyScan<'a>,
        disk: &'a dyn DiskInterface,
        status: &'a mut dyn Status,
    ) -> anyhow::Result<Builder<'a>> {
        if config.logfiles_enabled {
            disk.make_dirs(&format!("{}/failed_parts", config.logs_dir))?;
        }
        let lock_file_path = match &graph.build_dir {
            Some(dir) if !dir.is_empty() => format!("{}/{}", dir, LOCK_FILE_NAME),
            _ => LOCK_FILE_NAME.to_string(),
        };
        Ok(Builder {
            graph,
            config: config.clone(),
            plan: Plan::new(),
            scan,
            disk,
            status,
            runner: None,
            running_edges: HashMap::new(),
            failed_edges: Vec::new(),
            lock_file_path,
            start_time: Instant::now(),
        })
    }

    /// Inject a runner instead of the one `build` would construct.
    pub fn set_runner(&mut self, runner: Box<dyn CommandRunner + 'a>) {
        self.runner = Some(runner);
    }

    pub fn add_target_by_name(&mut self, name: &str) -> anyhow::Result<FileId> {
        let id = self
            .graph
            .lookup_file(name)
            .ok_or_else(|| anyhow::anyhow!("unknown target: '{}'", name))?;
        self.add_target(id)?;
        Ok(id)
    }

    /// Scan the target's dirty state and pull it (plus any validation
    /// targets discovered on the way) into the plan.
    pub fn add_target(&mut self, target: FileId) -> anyhow::Result<()> {
        let mut validations = Vec::new();
        self.scan
            .recompute_dirty(self.graph, target, &mut validations)?;

        let done = match self.graph.file(target).in_edge {
            Some(edge) => self.graph.edge(edge).outputs_ready,
            None => false,
        };
        if !done {
            self.plan.add_target(self.graph, target)?;
        }

        for v in validations {
            if let Some(edge) = self.graph.file(v).in_edge {
                if !self.graph.edge(edge).outputs_ready {
                    self.plan.add_target(self.graph, v)?;
                }
            }
        }
        Ok(())
    }

    pub fn already_up_to_date(&self) -> bool {
        !self.plan.more_to_do()
    }

    pub fn build(&mut self) -> anyhow::Result<()> {
        assert!(!self.already_up_to_date());
        trace::scope("prepare_queue", || self.plan.prepare_queue(self.graph));

        self.status
            .plan_has_total_edges(self.plan.command_edge_count());
        let mut pending_commands: usize = 0;
        let mut failures_allowed = self.config.failures_allowed;

        if self.runner.is_none() {
            self.runner = Some(if self.config.dry_run {
                Box::new(DryRunCommandRunner::default())
            } else {
                Box::new(RealCommandRunner::new(&self.config))
            });
        }

        self.status.build_started();
        self.runner.as_mut().unwrap().run_watcher();

        // Steady state: start as many commands as the runner admits, then
        // block reaping the next completion.
        while self.plan.more_to_do() {
            if failures_allowed > 0 {
                let mut capacity = self.runner.as_ref().unwrap().can_run_more();
                while capacity > 0 {
                    let edge = match self.plan.find_work() {
                        None => break,
                        Some(edge) => edge,
                    };

                    if self.graph.edge(edge).generator {
                        // The command may rewrite the manifest world; don't
                        // hold the journal open across it.
                        self.scan.build_log_mut().close();
                    }

                    if let Err(err) = self.start_edge(edge) {
                        self.cleanup();
                        self.status.build_finished();
                        return Err(err);
                    }

                    if self.graph.edge(edge).is_phony() {
                        if let Err(err) = self
                            .plan
                            .edge_finished(self.graph, edge, EdgeResult::Succeeded)
                            .and_then(|()| self.drain_dyndeps())
                        {
                            self.cleanup();
                            self.status.build_finished();
                            return Err(err);
                        }
                    } else {
                        pending_commands += 1;
                        capacity -= 1;
                        capacity = capacity.min(self.runner.as_ref().unwrap().can_run_more());
                    }
                }

                if pending_commands == 0 && !self.plan.more_to_do() {
                    break;
                }
            }

            if pending_commands > 0 {
                let reaped = self.runner.as_mut().unwrap().wait_for_command();
                let mut result = match reaped {
                    Some(result) if result.termination != Termination::Interrupted => result,
                    _ => {
                        self.cleanup();
                        self.status.build_finished();
                        anyhow::bail!("interrupted by user");
                    }
                };

                pending_commands -= 1;
                if let Err(err) = self.finish_command(&mut result) {
                    self.cleanup();
                    self.status.build_finished();
                    return Err(err);
                }

                if !result.success() {
                    self.failed_edges.push(result.label.clone());
                    if failures_allowed > 0 {
                        failures_allowed -= 1;
                    }
                }
                continue;
            }

            // Nothing pending and nothing startable.
            self.status.build_finished();
            if failures_allowed == 0 && !self.failed_edges.is_empty() {
                if self.config.logfiles_enabled {
                    self.write_failed_parts();
                }
                let parts = self
                    .failed_edges
                    .iter()
                    .map(|label| format!("\"{}\"", label))
                    .collect::<Vec<_>>()
                    .join(" ");
                if self.config.failures_allowed > 1 {
                    anyhow::bail!("subcommands failed: {}", parts);
                }
                anyhow::bail!("subcommand failed: {}", parts);
            } else if failures_allowed < self.config.failures_allowed {
                anyhow::bail!("cannot make progress due to previous errors");
            } else {
                anyhow::bail!("stuck [this is a bug]");
            }
        }

        self.status.build_finished();
        self.runner.as_mut().unwrap().stop_watcher();
        self.remove_lock_file();
        Ok(())
    }

    fn start_edge(&mut self, edge: EdgeId) -> anyhow::Result<()> {
        trace::scope("start_edge", || self.start_edge_inner(edge))
    }

    fn start_edge_inner(&mut self, edge: EdgeId) -> anyhow::Result<()> {
        if self.graph.edge(edge).is_phony() {
            return Ok(());
        }

        let start_ms = self.start_time.elapsed().as_millis() as u64;
        self.running_edges.insert(edge, start_ms);
        self.status.build_edge_started(self.graph, edge, start_ms);

        // Create output directories, and stamp the lock file so the journal
        // can record when this command began observing its inputs.
        let mut build_start: Option<MTime> = None;
        for i in 0..self.graph.edge(edge).outs.ids.len() {
            let out = self.graph.edge(edge).outs.ids[i];
            let path = self.graph.file(out).name.clone();
            self.disk.make_dirs(&path)?;
            if build_start.is_none() {
                let _ = self.disk.write_file(&self.lock_file_path, "");
                let stamp = self
                    .disk
                    .stat(&self.lock_file_path)
                    .unwrap_or(MTime::Missing);
                build_start = Some(stamp);
            }
        }
        self.graph.edge_mut(edge).command_start_time =
            build_start.unwrap_or(MTime::Missing);

        if let Some(rspfile) = self.graph.edge(edge).rspfile.clone() {
            self.disk.make_dirs(&rspfile.path)?;
            self.disk.write_file(&rspfile.path, &rspfile.content)?;
        }

        if let Err(err) = self
            .runner
            .as_mut()
            .unwrap()
            .start_command(self.graph, edge)
        {
            let cmdline = self.graph.edge(edge).cmdline.clone().unwrap_or_default();
            anyhow::bail!("command '{}' failed to start: {}", cmdline, err);
        }
        Ok(())
    }

    fn finish_command(&mut self, result: &mut TaskDone) -> anyhow::Result<()> {
        trace::scope("finish_command", || self.finish_command_inner(result))
    }

    fn finish_command_inner(&mut self, result: &mut TaskDone) -> anyhow::Result<()> {
        let edge = result.edge;

        // Extract discovered deps first: it filters include noise out of the
        // output (wanted even when the compile failed), and an extraction
        // error turns a nominal success into a failure.
        let deps_type = self.graph.edge(edge).deps;
        let mut deps_nodes: Vec<FileId> = Vec::new();
        if deps_type.is_some() {
            match self.extract_deps(result) {
                Ok(nodes) => deps_nodes = nodes,
                Err(err) => {
                    if result.success() {
                        if !result.output.is_empty() {
                            result.output.push(b'\n');
                        }
                        result.output.extend_from_slice(err.to_string().as_bytes());
                        result.termination = Termination::Failure;
                    }
                }
            }
        }

        let start_ms = self.running_edges.remove(&edge).unwrap_or(0);
        let end_ms = self.start_time.elapsed().as_millis() as u64;

        self.status.build_edge_finished(
            self.graph,
            edge,
            end_ms,
            result.success(),
            &result.output,
        );

        if !result.success() {
            self.plan
                .edge_finished(self.graph, edge, EdgeResult::Failed)?;
            return Ok(());
        }

        // Restat: a command that left its outputs untouched lets the rest of
        // the graph skip rebuilding them.
        let mut record_mtime = MTime::Missing;
        if !self.config.dry_run {
            let restat = self.graph.edge(edge).restat;
            let generator = self.graph.edge(edge).generator;
            let mut node_cleaned = false;
            record_mtime = self.graph.edge(edge).command_start_time;

            if record_mtime.nanos() == 0 || restat || generator {
                for i in 0..self.graph.edge(edge).outs.ids.len() {
                    let out = self.graph.edge(edge).outs.ids[i];
                    let path = self.graph.file(out).name.clone();
                    let new_mtime = self.disk.stat(&path)?;
                    if new_mtime.nanos() > record_mtime.nanos() {
                        record_mtime = new_mtime;
                    }
                    if self.graph.file(out).mtime == new_mtime && restat {
                        // Unchanged output: propagate cleanliness downstream.
                        self.plan.clean_node(self.graph, &self.scan, out)?;
                        node_cleaned = true;
                    }
                }
            }
            if node_cleaned {
                record_mtime = self.graph.edge(edge).command_start_time;
                // Cleaning may have shrunk the plan.
                self.status
                    .plan_has_total_edges(self.plan.command_edge_count());
            }
        }

        self.plan
            .edge_finished(self.graph, edge, EdgeResult::Succeeded)?;
        self.drain_dyndeps()?;

        if let Some(rspfile) = self.graph.edge(edge).rspfile.clone() {
            if !self.config.keep_rspfile {
                let _ = self.disk.remove_file(&rspfile.path);
            }
        }

        if !self.config.dry_run {
            self.scan
                .build_log_mut()
                .record_command(self.graph, edge, start_ms, end_ms, record_mtime)
                .map_err(|err| anyhow::anyhow!("Error writing to build log: {}", err))?;
        }

        if deps_type.is_some() && !self.config.dry_run {
            let dep_paths: Vec<String> = deps_nodes
                .iter()
                .map(|&d| self.graph.file(d).name.clone())
                .collect();
            for i in 0..self.graph.edge(edge).outs.ids.len() {
                let out = self.graph.edge(edge).outs.ids[i];
                let path = self.graph.file(out).name.clone();
                let deps_mtime = self.disk.stat(&path)?;
                self.scan
                    .deps_log_mut()
                    .record_deps(&path, deps_mtime, &dep_paths)
                    .map_err(|err| anyhow::anyhow!("Error writing to deps log: {}", err))?;
            }
        }
        Ok(())
    }

    fn extract_deps(&mut self, result: &mut TaskDone) -> anyhow::Result<Vec<FileId>> {
        let edge = result.edge;
        match self.graph.edge(edge).deps {
            Some(DepsStyle::Msvc) => {
                let prefix = self
                    .graph
                    .edge(edge)
                    .msvc_deps_prefix
                    .clone()
                    .unwrap_or_else(|| clparser::DEFAULT_DEPS_PREFIX.to_string());
                let output = String::from_utf8_lossy(&result.output).into_owned();
                let parsed = clparser::parse_showincludes(&output, &prefix);
                result.output = parsed.filtered_output.into_bytes();

                let mut nodes = Vec::new();
                for include in parsed.includes {
                    let id = self.graph.file_id(canon::canon_path(include));
                    self.graph.file_mut(id).generated_by_dep_loader = true;
                    nodes.push(id);
                }
                Ok(nodes)
            }
            Some(DepsStyle::Gcc) => {
                let depfile_path = self
                    .graph
                    .edge(edge)
                    .depfile
                    .clone()
                    .ok_or_else(|| {
                        anyhow::anyhow!("gcc-style deps without a depfile make no sense")
                    })?;
                // A missing depfile means the command emitted no deps.
                let mut content = match self.disk.read_file(&depfile_path)? {
                    ReadResult::Okay(bytes) => bytes,
                    ReadResult::NotFound => return Ok(Vec::new()),
                };
                content.push(0);
                let mut scanner = Scanner::new(&content);
                let parsed = depfile::parse(&mut scanner).map_err(|err| {
                    anyhow::anyhow!(scanner.format_parse_error(&depfile_path, err))
                })?;

                let mut nodes = Vec::new();
                for entry in parsed.iter() {
                    for dep in &entry.1 {
                        let id = self.graph.file_id(canon::canon_path(*dep));
                        self.graph.file_mut(id).generated_by_dep_loader = true;
                        nodes.push(id);
                    }
                }
                if !self.config.keep_depfile {
                    self.disk
                        .remove_file(&depfile_path)
                        .map_err(|err| anyhow::anyhow!("deleting depfile: {}", err))?;
                }
                Ok(nodes)
            }
            None => unreachable!("extract_deps called without a deps style"),
        }
    }

    fn drain_dyndeps(&mut self) -> anyhow::Result<()> {
        while let Some(node) = self.plan.pop_pending_dyndep() {
            self.load_dyndeps(node)?;
        }
        Ok(())
    }

    /// A dyndep file just became up to date: load it and fold the discovered
    /// subgraph into the plan.
    pub fn load_dyndeps(&mut self, node: FileId) -> anyhow::Result<()> {
        self.status.build_load_dyndeps();
        let ddf = self.scan.load_dyndeps(self.graph, node)?;
        self.plan
            .dyndeps_loaded(self.graph, &self.scan, node, &ddf)?;
        self.status
            .plan_has_total_edges(self.plan.command_edge_count());
        Ok(())
    }

    /// Failure path: conservatively delete half-produced outputs of edges
    /// that were still running, their depfiles, and the lock file.
    fn cleanup(&mut self) {
        if let Some(runner) = self.runner.as_mut() {
            let active = runner.active_edges();
            runner.abort();

            for edge in active {
                let depfile = self.graph.edge(edge).depfile.clone();
                for i in 0..self.graph.edge(edge).outs.ids.len() {
                    let out = self.graph.edge(edge).outs.ids[i];
                    let path = self.graph.file(out).name.clone();
                    // Delete an output only when the command modified it, so
                    // e.g. an interrupted generator keeps its manifest.  A
                    // depfile-using edge may have refreshed the depfile but
                    // not the output, so those outputs always go.
                    match self.disk.stat(&path) {
                        Err(err) => {
                            self.status.error(&err.to_string());
                            let _ = self.disk.remove_file(&path);
                        }
                        Ok(new_mtime) => {
                            if depfile.is_some() || self.graph.file(out).mtime != new_mtime {
                                let _ = self.disk.remove_file(&path);
                            }
                        }
                    }
                }
                if let Some(depfile) = depfile {
                    let _ = self.disk.remove_file(&depfile);
                }
            }
        }
        self.remove_lock_file();
    }

    fn remove_lock_file(&mut self) {
        if let Ok(mtime) = self.disk.stat(&self.lock_file_path) {
            if !mtime.is_missing() {
                let _ = self.disk.remove_file(&self.lock_file_path);
            }
        }
    }

    fn write_failed_parts(&mut self) {
        let path = format!("{}/failed_parts", self.config.logs_dir);
        let content = self.failed_edges.join(" ");
        let _ = self.disk.write_file(&path, &content);
    }
}
