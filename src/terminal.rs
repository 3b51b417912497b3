//! Terminal queries and text fitting for the progress banner.

#[cfg(unix)]
pub fn is_tty() -> bool {
    unsafe {
        libc::isatty(/* stdout */ 1) == 1
    }
}

#[cfg(unix)]
pub fn get_cols() -> Option<usize> {
    unsafe {
        let mut winsize = std::mem::zeroed::<libc::winsize>();
        if libc::ioctl(1, libc::TIOCGWINSZ, &mut winsize) < 0 {
            return None;
        }
        if winsize.ws_col < 10 {
            // Ignore degenerate widths, e.g. when run under some CI wrappers.
            return None;
        }
        Some(winsize.ws_col as usize)
    }
}

/// Elide the middle of a string so it fits in `width` columns.
pub fn elide_middle(text: &str, width: usize) -> String {
    const MARKER: &str = "...";
    if text.len() <= width {
        return text.to_string();
    }
    if width <= MARKER.len() {
        return MARKER[..width].to_string();
    }
    let keep = width - MARKER.len();
    let head = keep / 2 + keep % 2;
    let tail = keep / 2;
    format!("{}{}{}", &text[..head], MARKER, &text[text.len() - tail..])
}
