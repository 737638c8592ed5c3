// List files for relay startup: recognized group names and candidate names
// for peers that ask the relay to pick one.
//
// Format: one entry per line, surrounding whitespace trimmed, blank lines
// and lines starting with `#` ignored.

use std::fs;
use std::io;
use std::path::Path;

/// Parse list-file contents into entries.
pub fn parse_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Read and parse a list file.
pub fn load_list(path: &Path) -> io::Result<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    Ok(parse_list(&contents))
}
