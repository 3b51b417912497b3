//! Dynamic dependency files: dependencies discovered at build time from a
//! file that must itself be built first.
//!
//! A dyndep file declares, for edges that bind it, extra implicit inputs
//! and outputs and an optional restat flag:
//!
//! ```text
//! ninja_dyndep_version = 1
//! build out | extra.out : dyndep | extra.in other.in
//!   restat = 1
//! ```

use crate::canon::canon_path;
use crate::graph::{EdgeId, FileId, Graph};
use crate::scanner::{ParseResult, Scanner};
use crate::smallmap::SmallMap;

/// Discovered additions for one edge.
#[derive(Debug)]
pub struct Dyndeps {
    pub implicit_ins: Vec<FileId>,
    pub implicit_outs: Vec<FileId>,
    pub restat: bool,
}

/// The loaded content of a dyndep file, keyed by the edge it modifies.
pub type DyndepFile = SmallMap<EdgeId, Dyndeps>;

struct Statement<'a> {
    out: &'a str,
    implicit_outs: Vec<&'a str>,
    implicit_ins: Vec<&'a str>,
    restat: bool,
}

fn read_path<'a>(scanner: &mut Scanner<'a>) -> Option<&'a str> {
    scanner.skip_spaces();
    let start = scanner.ofs;
    loop {
        match scanner.peek() {
            '\0' | ' ' | '\n' | '\r' | ':' | '|' => break,
            _ => scanner.next(),
        }
    }
    if scanner.ofs == start {
        return None;
    }
    Some(scanner.slice(start, scanner.ofs))
}

fn skip_eol(scanner: &mut Scanner) -> ParseResult<()> {
    scanner.skip_spaces();
    scanner.skip('\r');
    if scanner.peek() == '\0' {
        return Ok(());
    }
    scanner.expect('\n')
}

fn parse<'a>(scanner: &mut Scanner<'a>) -> ParseResult<Vec<Statement<'a>>> {
    while matches!(scanner.peek(), '\n' | '\r') {
        scanner.next();
    }
    scanner.expect_token("ninja_dyndep_version")?;
    scanner.skip_spaces();
    scanner.expect('=')?;
    scanner.skip_spaces();
    let version = read_path(scanner).unwrap_or("");
    if version != "1" && !version.starts_with("1.") {
        return scanner.parse_error(format!("unsupported dyndep version {:?}", version));
    }
    skip_eol(scanner)?;

    let mut statements = Vec::new();
    loop {
        while matches!(scanner.peek(), '\n' | '\r') {
            scanner.next();
        }
        if scanner.peek() == '\0' {
            break;
        }
        scanner.expect_token("build")?;
        let out = match read_path(scanner) {
            Some(path) => path,
            None => return scanner.parse_error("expected output path"),
        };
        let mut implicit_outs = Vec::new();
        scanner.skip_spaces();
        if scanner.skip('|') {
            while let Some(path) = read_path(scanner) {
                implicit_outs.push(path);
            }
            scanner.skip_spaces();
        }
        scanner.expect(':')?;
        scanner.skip_spaces();
        scanner.expect_token("dyndep")?;
        let mut implicit_ins = Vec::new();
        scanner.skip_spaces();
        if scanner.skip('|') {
            while let Some(path) = read_path(scanner) {
                implicit_ins.push(path);
            }
        }
        skip_eol(scanner)?;

        // Indented binding lines; only restat is meaningful in dyndep files.
        let mut restat = false;
        while scanner.peek() == ' ' {
            scanner.skip_spaces();
            scanner.expect_token("restat")?;
            scanner.skip_spaces();
            scanner.expect('=')?;
            scanner.skip_spaces();
            let value = read_path(scanner).unwrap_or("");
            restat = !value.is_empty() && value != "0";
            skip_eol(scanner)?;
        }

        statements.push(Statement {
            out,
            implicit_outs,
            implicit_ins,
            restat,
        });
    }
    Ok(statements)
}

/// Parse dyndep file content and fold the discovered inputs/outputs into the
/// graph.  `node` is the dyndep file; every edge binding it must be covered.
pub fn load(graph: &mut Graph, node: FileId, mut content: Vec<u8>) -> anyhow::Result<DyndepFile> {
    content.push(0);
    let mut scanner = Scanner::new(&content);
    let statements = parse(&mut scanner).map_err(|err| {
        anyhow::anyhow!(scanner.format_parse_error(&graph.file(node).name, err))
    })?;

    let mut ddf = DyndepFile::default();
    for statement in statements {
        let out = canon_path(statement.out);
        let edge = graph
            .lookup_file(&out)
            .and_then(|f| graph.file(f).in_edge)
            .ok_or_else(|| anyhow::anyhow!("no build statement produces '{}'", out))?;
        if graph.edge(edge).dyndep != Some(node) {
            anyhow::bail!(
                "edge producing '{}' does not bind dyndep file '{}'",
                out,
                graph.file(node).name
            );
        }
        if ddf.get(&edge).is_some() {
            anyhow::bail!("multiple dyndep statements for '{}'", out);
        }

        let implicit_ins: Vec<FileId> = statement
            .implicit_ins
            .iter()
            .map(|path| graph.file_id(canon_path(*path)))
            .collect();
        let implicit_outs: Vec<FileId> = statement
            .implicit_outs
            .iter()
            .map(|path| graph.file_id(canon_path(*path)))
            .collect();

        for &input in &implicit_ins {
            if !graph.edge(edge).ins.ids.contains(&input) {
                graph.edge_mut(edge).ins.add_implicit(input);
                graph.file_mut(input).out_edges.push(edge);
            }
        }
        for &output in &implicit_outs {
            let file = graph.file_mut(output);
            if file.in_edge.is_some() {
                anyhow::bail!("multiple rules generate '{}'", file.name);
            }
            file.in_edge = Some(edge);
            let edge_mut = graph.edge_mut(edge);
            edge_mut.outs.ids.push(output);
            edge_mut.outs.implicit += 1;
        }
        if statement.restat {
            graph.edge_mut(edge).restat = true;
        }

        ddf.insert(
            edge,
            Dyndeps {
                implicit_ins,
                implicit_outs,
                restat: statement.restat,
            },
        );
    }

    // Every edge that names this file as its dyndep must have an entry, or
    // its discovered dependencies would silently stay unknown.
    let binders: Vec<EdgeId> = graph
        .edges
        .iter()
        .filter(|(_, e)| e.dyndep == Some(node))
        .map(|(id, _)| id)
        .collect();
    for edge in binders {
        if ddf.get(&edge).is_none() {
            anyhow::bail!(
                "dyndep file '{}' is missing an entry for '{}'",
                graph.file(node).name,
                graph.file(graph.edge(edge).outs.ids[0]).name
            );
        }
    }

    graph.file_mut(node).dyndep_pending = false;
    Ok(ddf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeIns, EdgeOuts};

    fn graph_with_dyndep_edge() -> (Graph, FileId, EdgeId, FileId) {
        let mut g = Graph::new();
        let src = g.file_id("a.c");
        let dd = g.file_id("a.dd");
        let out = g.file_id("a.o");
        let mut edge = Edge::new("cc");
        edge.cmdline = Some("cc a.c".to_string());
        edge.ins = EdgeIns::new(vec![src, dd], 1, 0);
        edge.outs = EdgeOuts::explicit(vec![out]);
        edge.dyndep = Some(dd);
        let edge = g.add_edge(edge).unwrap();
        g.file_mut(dd).dyndep_pending = true;
        (g, dd, edge, out)
    }

    #[test]
    fn load_adds_implicit_inputs() {
        let (mut g, dd, edge, _) = graph_with_dyndep_edge();
        let content = b"ninja_dyndep_version = 1\nbuild a.o : dyndep | hdr.h\n".to_vec();
        let ddf = load(&mut g, dd, content).unwrap();

        let hdr = g.lookup_file("hdr.h").unwrap();
        assert!(g.edge(edge).ins.ids.contains(&hdr));
        assert!(g.file(hdr).out_edges.contains(&edge));
        assert!(!g.file(dd).dyndep_pending);
        assert_eq!(ddf.get(&edge).unwrap().implicit_ins, vec![hdr]);
    }

    #[test]
    fn load_restat_and_implicit_outputs() {
        let (mut g, dd, edge, _) = graph_with_dyndep_edge();
        let content =
            b"ninja_dyndep_version = 1\nbuild a.o | a.mod : dyndep\n  restat = 1\n".to_vec();
        load(&mut g, dd, content).unwrap();

        assert!(g.edge(edge).restat);
        let module = g.lookup_file("a.mod").unwrap();
        assert_eq!(g.file(module).in_edge, Some(edge));
        assert_eq!(g.edge(edge).outs.implicit, 1);
    }

    #[test]
    fn load_rejects_unknown_output() {
        let (mut g, dd, _, _) = graph_with_dyndep_edge();
        let content = b"ninja_dyndep_version = 1\nbuild stranger.o : dyndep\n".to_vec();
        let err = load(&mut g, dd, content).unwrap_err();
        assert!(err.to_string().contains("no build statement produces"));
    }

    #[test]
    fn load_rejects_missing_entry() {
        let (mut g, dd, _, _) = graph_with_dyndep_edge();
        let content = b"ninja_dyndep_version = 1\n".to_vec();
        let err = load(&mut g, dd, content).unwrap_err();
        assert!(err.to_string().contains("missing an entry"));
    }

    #[test]
    fn load_rejects_bad_version() {
        let (mut g, dd, _, _) = graph_with_dyndep_edge();
        let content = b"ninja_dyndep_version = 2\nbuild a.o : dyndep\n".to_vec();
        let err = load(&mut g, dd, content).unwrap_err();
        assert!(err.to_string().contains("unsupported dyndep version"));
    }
}
