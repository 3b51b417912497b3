//! Supervision of running build commands.
//!
//! Each command gets a reader thread that streams its merged output pipe
//! into a synchronized buffer and reports completion over a channel; the
//! driver blocks in `do_work` until a completion or an interrupt arrives.
//! The watcher thread observes the same shared state to classify each
//! command as alive, silent, or stuck.

use crate::process::{self, Termination};
use crate::signal;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubprocessId(usize);

/// Liveness of a running command, judged by how recently it wrote output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    Alive,
    Silent,
    Stuck,
}

const SILENT_AFTER: Duration = Duration::from_secs(2);
const STUCK_AFTER: Duration = Duration::from_secs(5 * 60);

/// Per-command state shared between the reader thread, the driver, and the
/// watcher.
pub struct SubprocessShared {
    pid: Mutex<Option<libc::pid_t>>,
    output: Mutex<Vec<u8>>,
    last_output: Mutex<Instant>,
}

impl SubprocessShared {
    fn new() -> Self {
        SubprocessShared {
            pid: Mutex::new(None),
            output: Mutex::new(Vec::new()),
            last_output: Mutex::new(Instant::now()),
        }
    }

    pub fn pid(&self) -> Option<libc::pid_t> {
        *self.pid.lock().unwrap()
    }

    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.output.lock().unwrap())
    }

    pub fn status(&self) -> ProcessStatus {
        let elapsed = self.last_output.lock().unwrap().elapsed();
        if elapsed < SILENT_AFTER {
            ProcessStatus::Alive
        } else if elapsed < STUCK_AFTER {
            ProcessStatus::Silent
        } else {
            ProcessStatus::Stuck
        }
    }

    /// The most recent non-empty output line, as a progress hint.
    pub fn last_line(&self) -> Option<String> {
        last_nonempty_line(&self.output.lock().unwrap())
    }
}

fn last_nonempty_line(output: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(output);
    for line in text.lines().rev() {
        // Progress meters overwrite themselves with \r; show the final part.
        if let Some(part) = line.rsplit('\r').find(|part| !part.trim().is_empty()) {
            return Some(part.trim_end().to_string());
        }
    }
    None
}

pub struct Finished {
    pub id: SubprocessId,
    pub termination: Termination,
    pub shared: Arc<SubprocessShared>,
}

pub type RunningMap = HashMap<SubprocessId, Arc<SubprocessShared>>;

pub struct SubprocessSet {
    next_id: usize,
    running: Arc<Mutex<RunningMap>>,
    joins: HashMap<SubprocessId, JoinHandle<()>>,
    finished: VecDeque<Finished>,
    tx: Sender<Finished>,
    rx: Receiver<Finished>,
}

impl SubprocessSet {
    pub fn new() -> Self {
        signal::register_sigint();
        let (tx, rx) = mpsc::channel();
        SubprocessSet {
            next_id: 0,
            running: Arc::new(Mutex::new(HashMap::new())),
            joins: HashMap::new(),
            finished: VecDeque::new(),
            tx,
            rx,
        }
    }

    /// Start a command.  Output is captured into the shared buffer when
    /// `bufferize` is set and appended to `log_path` when given.
    pub fn add(
        &mut self,
        cmdline: &str,
        use_console: bool,
        bufferize: bool,
        log_path: Option<String>,
    ) -> SubprocessId {
        self.next_id += 1;
        let id = SubprocessId(self.next_id);
        let shared = Arc::new(SubprocessShared::new());
        self.running.lock().unwrap().insert(id, shared.clone());

        let tx = self.tx.clone();
        let cmdline = cmdline.to_string();
        let handle = std::thread::spawn(move || {
            let termination = run_subprocess(&shared, &cmdline, use_console, bufferize, log_path);
            // Send fails only when the set is being torn down.
            let _ = tx.send(Finished {
                id,
                termination,
                shared,
            });
        });
        self.joins.insert(id, handle);
        id
    }

    /// Block until some command completes (returns false) or the user
    /// interrupts (returns true).
    pub fn do_work(&mut self) -> bool {
        loop {
            match self.rx.recv_timeout(Duration::from_millis(200)) {
                Ok(finished) => {
                    self.running.lock().unwrap().remove(&finished.id);
                    if let Some(handle) = self.joins.remove(&finished.id) {
                        let _ = handle.join();
                    }
                    self.finished.push_back(finished);
                    return false;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if signal::was_interrupted() {
                        return true;
                    }
                }
                // We hold a sender, so the channel cannot disconnect.
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    pub fn next_finished(&mut self) -> Option<Finished> {
        self.finished.pop_front()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    /// A synchronized view of the running commands, for the watcher thread.
    pub fn running_view(&self) -> Arc<Mutex<RunningMap>> {
        self.running.clone()
    }

    /// Interrupt every running command and collect the reader threads.
    pub fn clear(&mut self) {
        for shared in self.running.lock().unwrap().values() {
            if let Some(pid) = shared.pid() {
                process::interrupt(pid);
            }
        }
        for (_, handle) in self.joins.drain() {
            let _ = handle.join();
        }
        self.running.lock().unwrap().clear();
        self.finished.clear();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Default for SubprocessSet {
    fn default() -> Self {
        SubprocessSet::new()
    }
}

fn run_subprocess(
    shared: &SubprocessShared,
    cmdline: &str,
    use_console: bool,
    bufferize: bool,
    log_path: Option<String>,
) -> Termination {
    let (pid, pipe) = match process::spawn(cmdline, use_console) {
        Ok(spawned) => spawned,
        Err(err) => {
            shared
                .output
                .lock()
                .unwrap()
                .extend_from_slice(err.to_string().as_bytes());
            return Termination::Failure;
        }
    };
    *shared.pid.lock().unwrap() = Some(pid);

    if let Some(mut pipe) = pipe {
        let mut log = log_path.and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
        let mut buf = [0u8; 8 << 10];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    *shared.last_output.lock().unwrap() = Instant::now();
                    if bufferize {
                        shared.output.lock().unwrap().extend_from_slice(&buf[..n]);
                    }
                    if let Some(log) = log.as_mut() {
                        let _ = log.write_all(&buf[..n]);
                    }
                }
            }
        }
    }

    match process::wait(pid) {
        Ok((termination, note)) => {
            if !note.is_empty() {
                shared.output.lock().unwrap().extend_from_slice(&note);
            }
            termination
        }
        Err(err) => {
            shared
                .output
                .lock()
                .unwrap()
                .extend_from_slice(err.to_string().as_bytes());
            Termination::Failure
        }
    }
}
