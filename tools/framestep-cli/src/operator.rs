//! Terminal operator: enter to start, live frame counter.
//!
//! The counter owns stdout; log lines go to stderr.

use framestep_core::{Operator, RecorderError};
use std::io::{self, BufRead, Stdout, Write};

pub struct TerminalOperator<W: Write = Stdout> {
    prompt: bool,
    frames: u64,
    out: W,
}

impl TerminalOperator {
    pub fn new(prompt: bool) -> Self {
        Self::with_output(prompt, io::stdout())
    }
}

impl<W: Write> TerminalOperator<W> {
    pub fn with_output(prompt: bool, out: W) -> Self {
        Self {
            prompt,
            frames: 0,
            out,
        }
    }

    /// End the `\r`-updated counter line.
    pub fn finish(&mut self) {
        if self.frames > 0 {
            let _ = writeln!(self.out);
        }
    }
}

impl<W: Write> Operator for TerminalOperator<W> {
    fn confirm_start(&mut self) -> Result<(), RecorderError> {
        if !self.prompt {
            return Ok(());
        }

        write!(self.out, "Press enter to start recording!")?;
        self.out.flush()?;

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(RecorderError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stdin closed before recording started",
            )));
        }
        Ok(())
    }

    fn frame_captured(&mut self, frames: u64) {
        self.frames = frames;
        let _ = write!(self.out, "\r{} frames captured", frames);
        let _ = self.out.flush();
    }
}
