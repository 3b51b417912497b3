//! The build journals: an append-only log of executed commands and an
//! append-only log of discovered dependencies.  Both are line-oriented text
//! with a version header; on open, existing records are folded into an
//! in-memory map (later records win) and the file is reopened for append.

use crate::fs::MTime;
use crate::graph::{EdgeId, Graph};
use hashbrown::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

const BUILD_LOG_HEADER: &str = "# bx build log v1";
const DEPS_LOG_HEADER: &str = "# bx deps log v1";

fn open_append(path: &str) -> anyhow::Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| anyhow::anyhow!("open {}: {}", path, err))?;
    Ok(BufWriter::new(file))
}

fn read_or_empty(path: &str) -> anyhow::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => anyhow::bail!("read {}: {}", path, err),
    }
}

/// Journal of command runs: start/end times and the recorded output mtime,
/// one line per output.  The recorded mtime backs restat dirtiness checks.
pub struct BuildLog {
    path: String,
    entries: HashMap<String, u64>,
    w: Option<BufWriter<File>>,
}

impl BuildLog {
    pub fn open(path: impl Into<String>) -> anyhow::Result<BuildLog> {
        let path = path.into();
        let mut entries = HashMap::new();
        for line in read_or_empty(&path)?.lines() {
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            let mut fields = line.splitn(4, '\t');
            let _start = fields.next();
            let _end = fields.next();
            let mtime = fields.next();
            let output = fields.next();
            match (mtime, output) {
                (Some(mtime), Some(output)) => {
                    let mtime: u64 = mtime
                        .parse()
                        .map_err(|_| anyhow::anyhow!("{}: bad build log line: {:?}", path, line))?;
                    entries.insert(output.to_string(), mtime);
                }
                _ => anyhow::bail!("{}: bad build log line: {:?}", path, line),
            }
        }
        Ok(BuildLog {
            path,
            entries,
            w: None,
        })
    }

    /// An in-memory log, for dry runs and tests.
    pub fn in_memory() -> BuildLog {
        BuildLog {
            path: String::new(),
            entries: HashMap::new(),
            w: None,
        }
    }

    pub fn recorded_mtime(&self, output: &str) -> Option<MTime> {
        self.entries.get(output).map(|&n| {
            if n == 0 {
                MTime::Missing
            } else {
                MTime::Stamp(n)
            }
        })
    }

    pub fn has_entry(&self, output: &str) -> bool {
        self.entries.contains_key(output)
    }

    fn writer(&mut self) -> anyhow::Result<&mut BufWriter<File>> {
        if self.w.is_none() {
            let fresh = !std::path::Path::new(&self.path).exists();
            let mut w = open_append(&self.path)?;
            if fresh {
                writeln!(w, "{}", BUILD_LOG_HEADER)?;
            }
            self.w = Some(w);
        }
        Ok(self.w.as_mut().unwrap())
    }

    pub fn record_command(
        &mut self,
        graph: &Graph,
        edge: EdgeId,
        start_ms: u64,
        end_ms: u64,
        mtime: MTime,
    ) -> anyhow::Result<()> {
        let nanos = mtime.nanos();
        let outs: Vec<String> = graph
            .edge(edge)
            .outs
            .ids
            .iter()
            .map(|&o| graph.file(o).name.clone())
            .collect();
        if !self.path.is_empty() {
            let w = self.writer()?;
            for name in &outs {
                writeln!(w, "{}\t{}\t{}\t{}", start_ms, end_ms, nanos, name)?;
            }
            w.flush()?;
        }
        for name in outs {
            self.entries.insert(name, nanos);
        }
        Ok(())
    }

    /// Flush and release the file handle.  Generator edges rewrite the
    /// manifest world out from under us, so the driver closes the log before
    /// running one; the next record reopens it.
    pub fn close(&mut self) {
        if let Some(mut w) = self.w.take() {
            let _ = w.flush();
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct DepsRecord {
    pub mtime: u64,
    pub deps: Vec<String>,
}

/// Journal of discovered dependencies per output.
pub struct DepsLog {
    path: String,
    entries: HashMap<String, DepsRecord>,
    w: Option<BufWriter<File>>,
}

impl DepsLog {
    pub fn open(path: impl Into<String>) -> anyhow::Result<DepsLog> {
        let path = path.into();
        let mut entries = HashMap::new();
        for line in read_or_empty(&path)?.lines() {
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let output = fields
                .next()
                .ok_or_else(|| anyhow::anyhow!("{}: bad deps log line: {:?}", path, line))?;
            let mtime: u64 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("{}: bad deps log line: {:?}", path, line))?;
            let deps = fields.map(str::to_string).collect();
            entries.insert(output.to_string(), DepsRecord { mtime, deps });
        }
        Ok(DepsLog {
            path,
            entries,
            w: None,
        })
    }

    pub fn in_memory() -> DepsLog {
        DepsLog {
            path: String::new(),
            entries: HashMap::new(),
            w: None,
        }
    }

    pub fn lookup(&self, output: &str) -> Option<&DepsRecord> {
        self.entries.get(output)
    }

    pub fn record_deps(
        &mut self,
        output: &str,
        mtime: MTime,
        deps: &[String],
    ) -> anyhow::Result<()> {
        let nanos = mtime.nanos();
        if !self.path.is_empty() {
            if self.w.is_none() {
                let fresh = !std::path::Path::new(&self.path).exists();
                let mut w = open_append(&self.path)?;
                if fresh {
                    writeln!(w, "{}", DEPS_LOG_HEADER)?;
                }
                self.w = Some(w);
            }
            let w = self.w.as_mut().unwrap();
            write!(w, "{}\t{}", output, nanos)?;
            for dep in deps {
                write!(w, "\t{}", dep)?;
            }
            writeln!(w)?;
            w.flush()?;
        }
        self.entries.insert(
            output.to_string(),
            DepsRecord {
                mtime: nanos,
                deps: deps.to_vec(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeOuts};

    #[test]
    fn build_log_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.log").to_str().unwrap().to_string();

        let mut graph = Graph::new();
        let out = graph.file_id("a.o");
        let mut edge = Edge::new("cc");
        edge.cmdline = Some("cc a.c".to_string());
        edge.outs = EdgeOuts::explicit(vec![out]);
        let edge = graph.add_edge(edge).unwrap();

        let mut log = BuildLog::open(path.as_str()).unwrap();
        log.record_command(&graph, edge, 10, 20, MTime::Stamp(333)).unwrap();
        log.close();

        let log = BuildLog::open(path.as_str()).unwrap();
        assert_eq!(log.recorded_mtime("a.o"), Some(MTime::Stamp(333)));
        assert_eq!(log.recorded_mtime("other"), None);
    }

    #[test]
    fn build_log_later_records_win() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.log").to_str().unwrap().to_string();

        let mut graph = Graph::new();
        let out = graph.file_id("a.o");
        let mut edge = Edge::new("cc");
        edge.outs = EdgeOuts::explicit(vec![out]);
        let edge = graph.add_edge(edge).unwrap();

        let mut log = BuildLog::open(path.as_str()).unwrap();
        log.record_command(&graph, edge, 0, 1, MTime::Stamp(1)).unwrap();
        log.record_command(&graph, edge, 2, 3, MTime::Stamp(2)).unwrap();
        log.close();

        let log = BuildLog::open(path.as_str()).unwrap();
        assert_eq!(log.recorded_mtime("a.o"), Some(MTime::Stamp(2)));
    }

    #[test]
    fn deps_log_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.log").to_str().unwrap().to_string();

        let mut log = DepsLog::open(path.as_str()).unwrap();
        log.record_deps(
            "a.o",
            MTime::Stamp(5),
            &["a.h".to_string(), "b.h".to_string()],
        )
        .unwrap();
        drop(log);

        let log = DepsLog::open(path.as_str()).unwrap();
        assert_eq!(
            log.lookup("a.o"),
            Some(&DepsRecord {
                mtime: 5,
                deps: vec!["a.h".to_string(), "b.h".to_string()],
            })
        );
    }

    #[test]
    fn deps_log_empty_deps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.log").to_str().unwrap().to_string();

        let mut log = DepsLog::open(path.as_str()).unwrap();
        log.record_deps("a.o", MTime::Stamp(5), &[]).unwrap();
        drop(log);

        let log = DepsLog::open(path.as_str()).unwrap();
        assert_eq!(log.lookup("a.o").unwrap().deps, Vec::<String>::new());
    }
}
