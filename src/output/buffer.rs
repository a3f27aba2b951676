//! Per-run output buffer.
//!
//! Append-only while a run is in progress, reset when the next run starts.
//! Only the router writes to it; surfaces and the save-output step read it.

use std::io::Write;
use std::path::Path;

#[derive(Debug, Default, Clone)]
pub struct OutputBuffer {
    text: String,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, text: &str) {
        self.text.push_str(text);
    }

    /// Replace the content with a single unit (background indicator mode)
    pub fn replace(&mut self, text: &str) {
        self.text.clear();
        self.text.push_str(text);
    }

    pub fn reset(&mut self) {
        self.text.clear();
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Write the current content to `path`, replacing it atomically
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        write_atomic(path, self.text.as_bytes())
    }
}

/// Write through a temp file in the same directory, then rename over `path`
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_basic_operations() {
        let mut buffer = OutputBuffer::new();
        assert!(buffer.is_empty());

        buffer.append("line 1\n");
        buffer.append("line ");
        buffer.append("2\n");

        assert_eq!(buffer.as_str(), "line 1\nline 2\n");
        assert_eq!(buffer.len(), 14);

        buffer.reset();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_replace_keeps_only_latest() {
        let mut buffer = OutputBuffer::new();
        buffer.append("old\n");
        buffer.replace("new");
        assert_eq!(buffer.as_str(), "new");
    }

    #[test]
    fn test_save_to_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "stale content that is longer").unwrap();

        let mut buffer = OutputBuffer::new();
        buffer.append("fresh\n");
        buffer.save_to(&path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh\n");
    }
}
