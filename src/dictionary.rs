//! Loads `--dict` files: one token per line, blanks and `#`-comments
//! ignored. Each surviving line is taken verbatim as a byte string.

use std::path::Path;

use crate::error::Result;

pub fn load(path: &Path) -> Result<Vec<Vec<u8>>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.as_bytes().to_vec())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.txt");
        std::fs::write(&path, "\n# comment\nfoo\n\nbar\n").unwrap();
        let tokens = load(&path).unwrap();
        assert_eq!(tokens, vec![b"foo".to_vec(), b"bar".to_vec()]);
    }
}
