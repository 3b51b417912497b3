//! Build progress reporting.  The driver narrates the build through the
//! `Status` trait; the console implementation prints one line per started
//! command plus failure output passthrough.

use crate::graph::{EdgeId, Graph};
use std::io::Write;

pub trait Status {
    /// The plan's total command count changed (initially, after restat
    /// cleaning, or after a dyndep load).
    fn plan_has_total_edges(&mut self, total: usize);
    fn build_started(&mut self);
    fn build_edge_started(&mut self, graph: &Graph, edge: EdgeId, start_ms: u64);
    fn build_edge_finished(
        &mut self,
        graph: &Graph,
        edge: EdgeId,
        end_ms: u64,
        success: bool,
        output: &[u8],
    );
    fn build_load_dyndeps(&mut self);
    fn build_finished(&mut self);
    fn error(&mut self, msg: &str);
}

/// The message shown for an edge: its description if set, else the command.
pub fn edge_message<'a>(graph: &'a Graph, edge: EdgeId) -> &'a str {
    let edge = graph.edge(edge);
    edge.desc
        .as_deref()
        .filter(|desc| !desc.is_empty())
        .or(edge.cmdline.as_deref())
        .unwrap_or(&edge.rule)
}

/// Plain console status: no overprinting, suitable for pipes and CI logs.
pub struct ConsoleStatus {
    verbose: bool,
    total: usize,
    started: usize,
}

impl ConsoleStatus {
    pub fn new(verbose: bool) -> Self {
        ConsoleStatus {
            verbose,
            total: 0,
            started: 0,
        }
    }
}

impl Status for ConsoleStatus {
    fn plan_has_total_edges(&mut self, total: usize) {
        self.total = total;
    }

    fn build_started(&mut self) {}

    fn build_edge_started(&mut self, graph: &Graph, edge: EdgeId, _start_ms: u64) {
        self.started += 1;
        let message = if self.verbose {
            graph.edge(edge).cmdline.as_deref().unwrap_or("")
        } else {
            edge_message(graph, edge)
        };
        println!("[{}/{}] {}", self.started, self.total, message);
    }

    fn build_edge_finished(
        &mut self,
        graph: &Graph,
        edge: EdgeId,
        _end_ms: u64,
        success: bool,
        output: &[u8],
    ) {
        if !success {
            println!("failed: {}", edge_message(graph, edge));
        }
        if !output.is_empty() {
            let _ = std::io::stdout().write_all(output);
        }
    }

    fn build_load_dyndeps(&mut self) {}

    fn build_finished(&mut self) {}

    fn error(&mut self, msg: &str) {
        eprintln!("error: {}", msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeOuts};

    #[test]
    fn message_prefers_description() {
        let mut g = Graph::new();
        let out = g.file_id("a.o");
        let mut edge = Edge::new("cc");
        edge.cmdline = Some("cc -c a.c -o a.o".to_string());
        edge.desc = Some("CC a.o".to_string());
        edge.outs = EdgeOuts::explicit(vec![out]);
        let edge = g.add_edge(edge).unwrap();
        assert_eq!(edge_message(&g, edge), "CC a.o");
    }

    #[test]
    fn message_falls_back_to_command() {
        let mut g = Graph::new();
        let out = g.file_id("a.o");
        let mut edge = Edge::new("cc");
        edge.cmdline = Some("cc -c a.c -o a.o".to_string());
        edge.desc = Some(String::new());
        edge.outs = EdgeOuts::explicit(vec![out]);
        let edge = g.add_edge(edge).unwrap();
        assert_eq!(edge_message(&g, edge), "cc -c a.c -o a.o");
    }
}
