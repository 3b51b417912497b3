//! Extraction of header dependencies from MSVC `cl.exe /showIncludes`
//! output.  The include lines are consumed as dependencies and removed from
//! the output so they do not show up on the console.

use std::collections::HashSet;

pub const DEFAULT_DEPS_PREFIX: &str = "Note: including file:";

pub struct CLParse {
    /// Command output with include notes and the echoed source name removed.
    pub filtered_output: String,
    /// Discovered headers, deduplicated, in first-seen order.
    pub includes: Vec<String>,
}

/// cl.exe echoes the bare source file name as the first line of output.
fn is_input_filename(line: &str) -> bool {
    let lower = line.trim().to_ascii_lowercase();
    !lower.contains(' ')
        && (lower.ends_with(".c")
            || lower.ends_with(".cc")
            || lower.ends_with(".cxx")
            || lower.ends_with(".cpp"))
}

pub fn parse_showincludes(output: &str, prefix: &str) -> CLParse {
    let mut filtered = String::with_capacity(output.len());
    let mut includes = Vec::new();
    let mut seen = HashSet::new();
    let mut first_line = true;

    for line in output.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix(prefix) {
            let path = rest.trim();
            if !path.is_empty() && seen.insert(path.to_string()) {
                includes.push(path.to_string());
            }
        } else if first_line && is_input_filename(line) {
            // Drop the echoed input name.
        } else {
            filtered.push_str(line);
            filtered.push('\n');
        }
        first_line = false;
    }

    CLParse {
        filtered_output: filtered,
        includes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_filters_includes() {
        let output = "foo.cc\n\
Note: including file: a/b.h\n\
Note: including file:    a/c.h\n\
some warning text\n";
        let parsed = parse_showincludes(output, DEFAULT_DEPS_PREFIX);
        assert_eq!(parsed.includes, vec!["a/b.h", "a/c.h"]);
        assert_eq!(parsed.filtered_output, "some warning text\n");
    }

    #[test]
    fn dedups_includes() {
        let output = "Note: including file: x.h\nNote: including file: x.h\n";
        let parsed = parse_showincludes(output, DEFAULT_DEPS_PREFIX);
        assert_eq!(parsed.includes, vec!["x.h"]);
        assert_eq!(parsed.filtered_output, "");
    }

    #[test]
    fn custom_prefix() {
        let output = "Remarque : inclusion du fichier : hdr.h\nkept\n";
        let parsed = parse_showincludes(output, "Remarque : inclusion du fichier :");
        assert_eq!(parsed.includes, vec!["hdr.h"]);
        assert_eq!(parsed.filtered_output, "kept\n");
    }

    #[test]
    fn keeps_unrelated_output() {
        let output = "main.cc\nerror C2065: undeclared identifier\n";
        let parsed = parse_showincludes(output, DEFAULT_DEPS_PREFIX);
        assert!(parsed.includes.is_empty());
        assert_eq!(parsed.filtered_output, "error C2065: undeclared identifier\n");
    }
}
