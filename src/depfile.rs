//! Parsing of Makefile syntax as found in `.d` files emitted by C compilers.

use crate::{
    scanner::{ParseResult, Scanner},
    smallmap::SmallMap,
};

/// Skip spaces and backslashed newlines.
fn skip_spaces(scanner: &mut Scanner) -> ParseResult<()> {
    loop {
        match scanner.read() {
            ' ' => {}
            '\\' => match scanner.read() {
                '\n' => {}
                '\r' => {
                    scanner.expect('\n')?;
                }
                _ => return scanner.parse_error("invalid backslash escape"),
            },
            _ => {
                scanner.back();
                break;
            }
        }
    }
    Ok(())
}

/// Read one path from the input scanner.
/// Note: treats colon as a valid character in a path because of
/// Windows-style paths, so the initial `output: ...` path includes the
/// trailing colon and is stripped by the caller.
fn read_path<'a>(scanner: &mut Scanner<'a>) -> ParseResult<Option<&'a str>> {
    skip_spaces(scanner)?;
    let start = scanner.ofs;
    loop {
        match scanner.read() {
            '\0' | ' ' | '\n' | '\r' => {
                scanner.back();
                break;
            }
            '\\' => {
                if scanner.peek() == '\n' || scanner.peek() == '\r' {
                    scanner.back();
                    break;
                }
            }
            _ => {}
        }
    }
    let end = scanner.ofs;
    if end == start {
        return Ok(None);
    }
    Ok(Some(scanner.slice(start, end)))
}

/// Parse a `.d` file into a map of target name to its dependencies.
pub fn parse<'a>(scanner: &mut Scanner<'a>) -> ParseResult<SmallMap<&'a str, Vec<&'a str>>> {
    let mut result = SmallMap::default();
    loop {
        while matches!(scanner.peek(), ' ' | '\n' | '\r') {
            scanner.next();
        }
        let target = match read_path(scanner)? {
            None => break,
            Some(o) => o,
        };
        scanner.skip_spaces();
        let target = match target.strip_suffix(':') {
            None => {
                scanner.expect(':')?;
                target
            }
            Some(target) => target,
        };
        let mut deps = Vec::new();
        while let Some(p) = read_path(scanner)? {
            deps.push(p);
        }
        result.insert(target, deps);
    }
    scanner.expect('\0')?;

    Ok(result)
}
