//! Presentation surfaces.
//!
//! A surface is whatever shows a run's output: a terminal, a document file,
//! or a recording used by tests and embedders. The router decides *what* to
//! show per presentation mode; the surface only knows *how*.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::buffer::write_atomic;
use crate::error::ResultExt;

pub trait OutputSurface: Send {
    /// A new run starts; forget whatever the previous run showed
    fn reset(&mut self);

    /// Append text verbatim (log modes)
    fn append(&mut self, text: &str);

    /// Show `content` as the whole document (rendered-document mode)
    fn render_document(&mut self, content: &str);

    /// Replace the one-line status (background indicator mode)
    fn show_status_line(&mut self, line: &str);

    /// 0..=100
    fn set_progress(&mut self, percent: u8);

    fn set_details_visible(&mut self, visible: bool);
}

/// Surface backed by the wrapper's own standard streams
pub struct TerminalSurface {
    out: Box<dyn Write + Send>,
    status: Box<dyn Write + Send>,
    document_path: Option<PathBuf>,
    /// Bytes of the document already echoed to `out`
    rendered_len: usize,
    details_visible: bool,
    /// Appends that arrived while details were hidden
    held: String,
}

impl TerminalSurface {
    /// Script output to stdout, chrome (progress, status) to stderr
    pub fn stdio(document_path: Option<PathBuf>) -> Self {
        Self::new(
            Box::new(std::io::stdout()),
            Box::new(std::io::stderr()),
            document_path,
        )
    }

    pub fn new(
        out: Box<dyn Write + Send>,
        status: Box<dyn Write + Send>,
        document_path: Option<PathBuf>,
    ) -> Self {
        Self {
            out,
            status,
            document_path,
            rendered_len: 0,
            details_visible: true,
            held: String::new(),
        }
    }

    fn write_out(&mut self, text: &str) {
        // A closed stdout must not take the engine down
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
    }

    fn write_status(&mut self, text: &str) {
        let _ = writeln!(self.status, "{}", text);
        let _ = self.status.flush();
    }
}

impl OutputSurface for TerminalSurface {
    fn reset(&mut self) {
        self.rendered_len = 0;
        self.held.clear();
    }

    fn append(&mut self, text: &str) {
        if self.details_visible {
            self.write_out(text);
        } else {
            self.held.push_str(text);
        }
    }

    fn render_document(&mut self, content: &str) {
        if let Some(path) = &self.document_path {
            write_atomic(path, content.as_bytes()).log_err();
        }
        // The terminal can't re-render; echo what was added since last time
        let added = content.get(self.rendered_len..).unwrap_or(content);
        self.write_out(added);
        self.rendered_len = content.len();
    }

    fn show_status_line(&mut self, line: &str) {
        self.write_status(line);
    }

    fn set_progress(&mut self, percent: u8) {
        self.write_status(&format!("Progress: {}%", percent));
    }

    /// Hidden details hold appended text back; showing them catches up
    fn set_details_visible(&mut self, visible: bool) {
        if visible == self.details_visible {
            return;
        }
        debug!(visible, held = self.held.len(), "Details pane toggled");
        self.details_visible = visible;
        if visible && !self.held.is_empty() {
            let held = std::mem::take(&mut self.held);
            self.write_out(&held);
        }
    }
}

/// Everything a [`MemorySurface`] was asked to show
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SurfaceRecord {
    /// Concatenation of all appends since the last reset
    pub text: String,
    pub appends: Vec<String>,
    pub documents: Vec<String>,
    pub status_lines: Vec<String>,
    pub progress: Vec<u8>,
    pub details_visible: Option<bool>,
    pub resets: usize,
}

/// Recording surface; clones share one record
#[derive(Debug, Default, Clone)]
pub struct MemorySurface {
    record: Arc<Mutex<SurfaceRecord>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SurfaceRecord {
        self.record.lock().clone()
    }
}

impl OutputSurface for MemorySurface {
    fn reset(&mut self) {
        let mut record = self.record.lock();
        record.text.clear();
        record.resets += 1;
    }

    fn append(&mut self, text: &str) {
        let mut record = self.record.lock();
        record.text.push_str(text);
        record.appends.push(text.to_owned());
    }

    fn render_document(&mut self, content: &str) {
        self.record.lock().documents.push(content.to_owned());
    }

    fn show_status_line(&mut self, line: &str) {
        self.record.lock().status_lines.push(line.to_owned());
    }

    fn set_progress(&mut self, percent: u8) {
        self.record.lock().progress.push(percent);
    }

    fn set_details_visible(&mut self, visible: bool) {
        self.record.lock().details_visible = Some(visible);
    }
}
