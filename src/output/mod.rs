//! Output routing
//!
//! Turns the decoded chunk stream of one run into side effects on the active
//! presentation surface:
//! - Log modes (progress indicator, scrolling log) append every chunk verbatim
//! - Rendered-document mode re-renders the whole buffer on every append
//! - Background-indicator mode keeps only the latest complete line
//! - No-output and drop-target modes drain without storing anything
//!
//! Independently of the mode, complete lines are scanned for directives
//! (`PROGRESS:n`, `DETAILS:SHOW|HIDE`, `QUITAPP`). The trailing incomplete
//! line is carried between chunks and flushed when the run ends.

mod buffer;
mod surface;

pub use buffer::OutputBuffer;
pub use surface::{MemorySurface, OutputSurface, SurfaceRecord, TerminalSurface};

use tracing::{debug, warn};

use crate::config::PresentationMode;
use crate::executor::OutputChunk;

/// Longest partial line carried between chunks; a longer one keeps its tail
const MAX_REMNANT_BYTES: usize = 64 * 1024;

/// Instruction embedded in a line of script output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Progress(u8),
    ShowDetails,
    HideDetails,
    Quit,
}

impl Directive {
    /// Parse one complete line (without its newline)
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches('\r').trim();
        if line == "QUITAPP" {
            return Some(Self::Quit);
        }
        if let Some(value) = line.strip_prefix("PROGRESS:") {
            let percent: u8 = value.trim().parse().ok()?;
            return (percent <= 100).then_some(Self::Progress(percent));
        }
        match line {
            "DETAILS:SHOW" => Some(Self::ShowDetails),
            "DETAILS:HIDE" => Some(Self::HideDetails),
            _ => None,
        }
    }
}

/// What consuming one chunk caused, beyond the surface updates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteEffects {
    /// First undecodable chunk of this run
    pub decode_warning: bool,
    /// A `QUITAPP` line was seen in this chunk
    pub quit_requested: bool,
}

pub struct OutputRouter {
    mode: PresentationMode,
    buffer: OutputBuffer,
    surface: Box<dyn OutputSurface>,
    remnant: String,
    decode_warned: bool,
    quit_requested: bool,
}

impl OutputRouter {
    pub fn new(mode: PresentationMode, surface: Box<dyn OutputSurface>) -> Self {
        Self {
            mode,
            buffer: OutputBuffer::new(),
            surface,
            remnant: String::new(),
            decode_warned: false,
            quit_requested: false,
        }
    }

    pub fn mode(&self) -> PresentationMode {
        self.mode
    }

    /// Contents of the current (or last finished) run
    pub fn buffer(&self) -> &OutputBuffer {
        &self.buffer
    }

    pub fn quit_requested(&self) -> bool {
        self.quit_requested
    }

    /// Reset per-run state before a new job starts
    pub fn begin_run(&mut self) {
        self.buffer.reset();
        self.remnant.clear();
        self.decode_warned = false;
        self.quit_requested = false;
        if self.has_surface() {
            self.surface.reset();
        }
    }

    /// Route one chunk to the surface
    pub fn route(&mut self, chunk: &OutputChunk) -> RouteEffects {
        let mut effects = RouteEffects::default();

        if chunk.malformed && !self.decode_warned {
            self.decode_warned = true;
            effects.decode_warning = true;
            warn!(mode = ?self.mode, "Undecodable output; replacement characters shown");
        }

        match self.mode {
            PresentationMode::ProgressIndicator | PresentationMode::ScrollingLog => {
                self.buffer.append(&chunk.text);
                self.surface.append(&chunk.text);
            }
            PresentationMode::RenderedDocument => {
                self.buffer.append(&chunk.text);
                self.surface.render_document(self.buffer.as_str());
            }
            PresentationMode::BackgroundIndicator
            | PresentationMode::None
            | PresentationMode::DropTarget => {}
        }

        effects.quit_requested = self.scan_lines(&chunk.text);
        effects
    }

    /// Flush the partial last line at end of run
    pub fn finish_run(&mut self) -> RouteEffects {
        let mut effects = RouteEffects::default();
        if !self.remnant.is_empty() {
            let line = std::mem::take(&mut self.remnant);
            effects.quit_requested = self.handle_line(&line);
        }
        effects
    }

    fn has_surface(&self) -> bool {
        !matches!(self.mode, PresentationMode::None | PresentationMode::DropTarget)
    }

    /// Returns true if a quit directive was among the completed lines
    fn scan_lines(&mut self, text: &str) -> bool {
        let mut quit = false;
        let mut rest = text;
        while let Some(pos) = rest.find('\n') {
            let (head, tail) = rest.split_at(pos);
            let line = if self.remnant.is_empty() {
                head.to_owned()
            } else {
                let mut line = std::mem::take(&mut self.remnant);
                line.push_str(head);
                line
            };
            quit |= self.handle_line(&line);
            rest = &tail[1..];
        }

        self.remnant.push_str(rest);
        if self.remnant.len() > MAX_REMNANT_BYTES {
            let mut cut = self.remnant.len() - MAX_REMNANT_BYTES;
            while !self.remnant.is_char_boundary(cut) {
                cut += 1;
            }
            self.remnant.drain(..cut);
        }
        quit
    }

    fn handle_line(&mut self, line: &str) -> bool {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if self.mode == PresentationMode::BackgroundIndicator && !line.trim().is_empty() {
            self.buffer.replace(line);
            self.surface.show_status_line(line);
        }

        match Directive::parse(line) {
            Some(Directive::Quit) => {
                debug!("Quit directive in script output");
                self.quit_requested = true;
                true
            }
            Some(directive) if self.mode == PresentationMode::ProgressIndicator => {
                match directive {
                    Directive::Progress(percent) => self.surface.set_progress(percent),
                    Directive::ShowDetails => self.surface.set_details_visible(true),
                    Directive::HideDetails => self.surface.set_details_visible(false),
                    Directive::Quit => {}
                }
                false
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for OutputRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRouter")
            .field("mode", &self.mode)
            .field("buffered", &self.buffer.len())
            .field("remnant", &self.remnant.len())
            .finish()
    }
}
