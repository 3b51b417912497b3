//! Lexical path canonicalization.
//!
//! Simplifies paths like "foo/./bar" => "foo/bar" without touching the disk.
//! Discovered dependency paths go through here before interning so the same
//! file never appears in the graph under two spellings.

fn is_sep(c: u8) -> bool {
    c == b'/' || c == b'\\'
}

/// Canonicalize a path in place: drop "." components, collapse "//", and
/// resolve ".." against earlier components where possible.  Each kept
/// component retains the separator that followed it in the input, so
/// Windows-style backslash paths come through unchanged.
pub fn canon_path_in_place(path: &mut String) {
    assert!(!path.is_empty());
    let src = std::mem::take(path).into_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(src.len());
    // Offsets of component starts in the output, for ".." to pop back to.
    let mut parents: Vec<usize> = Vec::new();

    let n = src.len();
    let mut i = 0;
    let absolute = is_sep(src[0]);
    if absolute {
        out.push(src[0]);
        i += 1;
    }

    while i < n {
        let start = i;
        while i < n && !is_sep(src[i]) {
            i += 1;
        }
        let comp = &src[start..i];
        let sep = if i < n {
            i += 1;
            Some(src[i - 1])
        } else {
            None
        };

        match comp {
            b"" | b"." => {}
            b".." => {
                if let Some(ofs) = parents.pop() {
                    out.truncate(ofs);
                } else if !absolute {
                    // Nothing to pop back over; keep the "..".
                    out.extend_from_slice(b"..");
                    if let Some(s) = sep {
                        out.push(s);
                    }
                }
                // A ".." at the root of an absolute path is dropped.
            }
            comp => {
                parents.push(out.len());
                out.extend_from_slice(comp);
                if let Some(s) = sep {
                    out.push(s);
                }
            }
        }
    }

    if out.is_empty() {
        out.push(b'.');
    }
    // Safety in spirit only: we only moved whole components around, so the
    // buffer is still the same UTF-8 it came in as.
    *path = String::from_utf8(out).unwrap();
}

#[must_use]
pub fn canon_path(path: impl Into<String>) -> String {
    let mut path = path.into();
    canon_path_in_place(&mut path);
    path
}
