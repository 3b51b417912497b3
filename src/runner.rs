//! Command runners: the seam between the build driver and actual command
//! execution.  The real runner owns the subprocess set, enforces the
//! parallelism and load-average admission budget, and hosts the optional
//! progress-watcher thread; the dry-run runner pretends everything succeeds
//! instantly.

use crate::graph::{EdgeId, Graph};
use crate::process::Termination;
use crate::subprocess::{ProcessStatus, RunningMap, SubprocessId, SubprocessSet};
use crate::terminal;
use crate::work::{BuildConfig, Verbosity};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Result of running one edge's command.
pub struct TaskDone {
    pub edge: EdgeId,
    pub termination: Termination,
    /// Combined stdout/stderr; empty unless bufferization is enabled.
    pub output: Vec<u8>,
    /// Shortened rule label, for failure summaries.
    pub label: String,
}

impl TaskDone {
    pub fn success(&self) -> bool {
        self.termination == Termination::Success
    }
}

pub trait CommandRunner {
    /// How many more commands may start right now.
    fn can_run_more(&self) -> usize;
    fn start_command(&mut self, graph: &Graph, edge: EdgeId) -> anyhow::Result<()>;
    /// Block until some command finishes.  None means the user interrupted.
    fn wait_for_command(&mut self) -> Option<TaskDone>;
    /// Edges started but not yet reaped, for failure cleanup.
    fn active_edges(&self) -> Vec<EdgeId>;
    fn abort(&mut self);
    fn run_watcher(&mut self) {}
    fn stop_watcher(&mut self) {}
}

/// Shorten a rule name for failure reports: trim a "___"-suffixed variant
/// tail, then a leading namespace segment.
pub fn default_label(rule: &str) -> String {
    let mut name = rule;
    if let Some(pos) = name.rfind("___") {
        name = &name[..pos];
        if let Some(pos) = name.rfind('_') {
            name = &name[pos + 1..];
        }
    }
    name.to_string()
}

/// Runner that never executes anything; commands finish successfully the
/// moment they are waited on.
#[derive(Default)]
pub struct DryRunCommandRunner {
    finished: VecDeque<EdgeId>,
}

impl CommandRunner for DryRunCommandRunner {
    fn can_run_more(&self) -> usize {
        usize::MAX
    }

    fn start_command(&mut self, _graph: &Graph, edge: EdgeId) -> anyhow::Result<()> {
        self.finished.push_back(edge);
        Ok(())
    }

    fn wait_for_command(&mut self) -> Option<TaskDone> {
        self.finished.pop_front().map(|edge| TaskDone {
            edge,
            termination: Termination::Success,
            output: Vec::new(),
            label: String::new(),
        })
    }

    fn active_edges(&self) -> Vec<EdgeId> {
        Vec::new()
    }

    fn abort(&mut self) {}
}

#[cfg(unix)]
fn load_average() -> f64 {
    unsafe {
        let mut avg = [0f64; 3];
        if libc::getloadavg(avg.as_mut_ptr(), 3) < 1 {
            0.0
        } else {
            avg[0]
        }
    }
}

pub struct RealCommandRunner {
    config: BuildConfig,
    subprocs: SubprocessSet,
    subproc_to_edge: HashMap<SubprocessId, EdgeId>,
    /// Labels of running commands, shared with the watcher thread.
    labels: Arc<Mutex<HashMap<SubprocessId, String>>>,
    watcher: Option<JoinHandle<()>>,
    watcher_run: Arc<(Mutex<bool>, Condvar)>,
}

impl RealCommandRunner {
    pub fn new(config: &BuildConfig) -> Self {
        RealCommandRunner {
            config: config.clone(),
            subprocs: SubprocessSet::new(),
            subproc_to_edge: HashMap::new(),
            labels: Arc::new(Mutex::new(HashMap::new())),
            watcher: None,
            watcher_run: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }
}

impl CommandRunner for RealCommandRunner {
    fn can_run_more(&self) -> usize {
        let in_flight = self.subprocs.running_count() + self.subprocs.finished_count();
        let mut capacity = self.config.parallelism as i64 - in_flight as i64;

        if self.config.max_load_average > 0.0 {
            let load_capacity = (self.config.max_load_average - load_average()) as i64;
            if load_capacity < capacity {
                capacity = load_capacity;
            }
        }

        if capacity < 0 {
            capacity = 0;
        }
        if capacity == 0 && self.subprocs.running_count() == 0 {
            // Forward-progress valve: a loaded machine must still finish the
            // build one command at a time.
            capacity = 1;
        }
        capacity as usize
    }

    fn start_command(&mut self, graph: &Graph, edge: EdgeId) -> anyhow::Result<()> {
        let e = graph.edge(edge);
        let cmdline = e.cmdline.clone().expect("phony edges never reach the runner");
        let label = (self.config.label_fn)(&e.rule);

        let log_path = if self.config.logfiles_enabled {
            let path = format!("{}/{}.log", self.config.logs_dir, label);
            std::fs::write(&path, format!("Command: {}\n\n", cmdline))?;
            Some(path)
        } else {
            None
        };

        let id = self.subprocs.add(
            &cmdline,
            e.use_console(),
            self.config.enable_bufferization,
            log_path,
        );
        self.subproc_to_edge.insert(id, edge);
        self.labels.lock().unwrap().insert(id, label);
        Ok(())
    }

    fn wait_for_command(&mut self) -> Option<TaskDone> {
        let finished = loop {
            if let Some(finished) = self.subprocs.next_finished() {
                break finished;
            }
            if self.subprocs.do_work() {
                return None;
            }
        };

        let edge = self
            .subproc_to_edge
            .remove(&finished.id)
            .expect("finished subprocess with no edge");
        let label = self
            .labels
            .lock()
            .unwrap()
            .remove(&finished.id)
            .unwrap_or_default();
        Some(TaskDone {
            edge,
            termination: finished.termination,
            output: finished.shared.take_output(),
            label,
        })
    }

    fn active_edges(&self) -> Vec<EdgeId> {
        self.subproc_to_edge.values().copied().collect()
    }

    fn abort(&mut self) {
        self.stop_watcher();
        self.subprocs.clear();
    }

    fn run_watcher(&mut self) {
        // The banner needs captured output to display, a verbose build to be
        // worth the noise, and a real terminal to overprint on.
        let no_tty = std::env::var("NO_TTY").unwrap_or_default();
        if self.config.verbosity != Verbosity::Verbose
            || !self.config.enable_bufferization
            || no_tty == "1"
        {
            return;
        }

        *self.watcher_run.0.lock().unwrap() = true;
        let running = self.subprocs.running_view();
        let labels = self.labels.clone();
        let state = self.watcher_run.clone();

        self.watcher = Some(std::thread::spawn(move || loop {
            let rows = snapshot_rows(&running, &labels);
            if !rows.is_empty() {
                if let Some(cols) = terminal::get_cols() {
                    use std::io::Write;
                    let banner = render_banner(&rows, cols);
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(banner.as_bytes());
                    let _ = stdout.flush();
                }
            }

            let (lock, cond) = &*state;
            let guard = lock.lock().unwrap();
            let (guard, _) = cond
                .wait_timeout_while(guard, Duration::from_secs(1), |run| *run)
                .unwrap();
            if !*guard {
                break;
            }
        }));
    }

    fn stop_watcher(&mut self) {
        {
            let (lock, cond) = &*self.watcher_run;
            *lock.lock().unwrap() = false;
            cond.notify_all();
        }
        if let Some(handle) = self.watcher.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RealCommandRunner {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

type WatchRow = (libc::pid_t, String, String);

fn snapshot_rows(
    running: &Arc<Mutex<RunningMap>>,
    labels: &Arc<Mutex<HashMap<SubprocessId, String>>>,
) -> Vec<WatchRow> {
    let running = running.lock().unwrap();
    let labels = labels.lock().unwrap();
    let mut rows = Vec::new();
    for (id, shared) in running.iter() {
        let pid = match shared.pid() {
            Some(pid) if pid > 0 => pid,
            _ => continue,
        };
        let label = labels.get(id).cloned().unwrap_or_default();
        let message = match shared.status() {
            ProcessStatus::Alive => shared
                .last_line()
                .unwrap_or_else(|| "starting...".to_string()),
            ProcessStatus::Silent => "no output".to_string(),
            ProcessStatus::Stuck => {
                "no output for over 5 minutes; waiting (kill manually to give up)".to_string()
            }
        };
        rows.push((pid, label, message));
    }
    rows.sort();
    rows
}

const CLEAR_TO_EOL: &str = "\x1b[K";
const CLEAR_BELOW: &str = "\x1b[J";

/// A `#`-framed banner of running commands that overwrites itself in place.
fn render_banner(rows: &[WatchRow], cols: usize) -> String {
    let frame = format!("{}\n", "#".repeat(cols));
    let mut banner = frame.clone();
    for (pid, label, message) in rows {
        let row = format!("# {} {}: {}", pid, label, message);
        banner.push_str(&terminal::elide_middle(&row, cols));
        banner.push_str(CLEAR_TO_EOL);
        banner.push('\n');
    }
    banner.push_str(&frame);
    banner.push_str(CLEAR_BELOW);
    // Cursor back up to the banner top so the next paint overwrites it.
    banner.push_str(&format!("\x1b[{}A", rows.len() + 2));
    banner
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeOuts};

    #[test]
    fn label_trims_variant_suffix_and_namespace() {
        assert_eq!(default_label("app_media___arm64"), "media");
        assert_eq!(default_label("core___v2"), "core");
        assert_eq!(default_label("plain"), "plain");
        assert_eq!(default_label("a_b_c"), "a_b_c");
    }

    #[test]
    fn banner_shape() {
        let rows = vec![
            (101, "media".to_string(), "compiling foo.c".to_string()),
            (102, "ui".to_string(), "linking".to_string()),
        ];
        let banner = render_banner(&rows, 40);
        let hashes = "#".repeat(40);
        assert!(banner.starts_with(&format!("{}\n", hashes)));
        assert!(banner.contains("# 101 media: compiling foo.c"));
        assert!(banner.contains("# 102 ui: linking"));
        assert!(banner.ends_with("\x1b[4A"));
    }

    #[test]
    fn banner_elides_wide_rows() {
        let rows = vec![(
            7,
            "toolchain".to_string(),
            "a very long message that cannot possibly fit".to_string(),
        )];
        let banner = render_banner(&rows, 24);
        for line in banner.lines() {
            let printable = line
                .replace(CLEAR_TO_EOL, "")
                .replace(CLEAR_BELOW, "")
                .replace("\x1b[3A", "");
            assert!(printable.len() <= 24, "too wide: {:?}", printable);
        }
    }

    #[test]
    fn dry_run_is_unbounded_and_immediate() {
        let mut g = Graph::new();
        let out = g.file_id("x");
        let mut edge = Edge::new("cc");
        edge.cmdline = Some("cc x".to_string());
        edge.outs = EdgeOuts::explicit(vec![out]);
        let edge = g.add_edge(edge).unwrap();

        let mut runner = DryRunCommandRunner::default();
        assert_eq!(runner.can_run_more(), usize::MAX);
        runner.start_command(&g, edge).unwrap();
        let done = runner.wait_for_command().unwrap();
        assert_eq!(done.edge, edge);
        assert!(done.success());
    }

    #[test]
    fn capacity_respects_parallelism() {
        let config = BuildConfig {
            parallelism: 4,
            ..BuildConfig::default()
        };
        let runner = RealCommandRunner::new(&config);
        assert_eq!(runner.can_run_more(), 4);
    }

    #[test]
    fn forward_progress_valve() {
        // A load bound far below the current load yields no capacity, but
        // with nothing running we still admit one command.
        let config = BuildConfig {
            parallelism: 4,
            max_load_average: 0.000001,
            ..BuildConfig::default()
        };
        let runner = RealCommandRunner::new(&config);
        assert_eq!(runner.can_run_more(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn real_runner_round_trip() {
        let mut g = Graph::new();
        let out = g.file_id("ignored");
        let mut edge = Edge::new("echo");
        edge.cmdline = Some("echo roundtrip".to_string());
        edge.outs = EdgeOuts::explicit(vec![out]);
        let edge = g.add_edge(edge).unwrap();

        let config = BuildConfig {
            parallelism: 2,
            enable_bufferization: true,
            ..BuildConfig::default()
        };
        let mut runner = RealCommandRunner::new(&config);
        runner.start_command(&g, edge).unwrap();
        assert_eq!(runner.active_edges(), vec![edge]);
        let done = runner.wait_for_command().unwrap();
        assert_eq!(done.edge, edge);
        assert!(done.success());
        assert_eq!(String::from_utf8_lossy(&done.output), "roundtrip\n");
        assert!(runner.active_edges().is_empty());
    }
}
