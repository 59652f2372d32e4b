//! Output sanitation
//!
//! Sandbox output is returned to learners as-is, so everything outside
//! printable ASCII, tab and newline is dropped.

/// Strip every character that is not printable ASCII, `\t` or `\n`
pub fn sanitize(text: &str) -> String {
    sanitize_bytes(text.as_bytes())
}

/// Strip every byte that is not printable ASCII, `\t` or `\n`
///
/// Works on raw log bytes, so invalid UTF-8 is dropped along with any other
/// non-ASCII byte.
pub fn sanitize_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .copied()
        .filter(|byte| is_kept(*byte))
        .map(char::from)
        .collect()
}

fn is_kept(byte: u8) -> bool {
    matches!(byte, b'\t' | b'\n' | 0x20..=0x7e)
}
