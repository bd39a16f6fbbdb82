//! Interactive `[yN]` confirmation.
//!
//! Commands that destroy or recreate experiments ask before acting. The
//! [`Confirm`] trait lets tests and `--yes` skip the terminal.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};

pub trait Confirm {
    /// Show `preamble` (may be empty), ask `prompt`, and return the answer.
    fn confirm(&self, preamble: &str, prompt: &str) -> Result<bool>;
}

/// Reads the answer from stdin; only `y`/`Y` means yes.
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, preamble: &str, prompt: &str) -> Result<bool> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        if !preamble.is_empty() {
            writeln!(out, "{preamble}").context("write preamble")?;
        }
        write!(out, "{prompt}").context("write prompt")?;
        out.flush().context("flush prompt")?;

        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("read answer")?;
        Ok(is_yes(&answer))
    }
}

/// Answers yes without asking (`--yes`).
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _preamble: &str, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

fn is_yes(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("y")
}
