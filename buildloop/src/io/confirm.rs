//! Operator confirmation for destructive or divergent actions.

use std::io::{self, BufRead, IsTerminal, Write};

use anyhow::{Context, Result};

pub trait Confirm {
    /// False when nobody can answer (no terminal attached).
    fn is_interactive(&self) -> bool;

    /// Ask a yes/no question. Only meaningful when interactive.
    fn confirm(&self, question: &str) -> Result<bool>;
}

/// Asks on stderr and reads the answer from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn is_interactive(&self) -> bool {
        io::stdin().is_terminal()
    }

    fn confirm(&self, question: &str) -> Result<bool> {
        let mut stderr = io::stderr();
        write!(stderr, "{question} [y/N] ").context("write prompt")?;
        stderr.flush().context("flush prompt")?;
        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("read answer")?;
        Ok(is_yes(&answer))
    }
}

/// Answers every question the same way without prompting.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl Confirm for FixedAnswer {
    fn is_interactive(&self) -> bool {
        true
    }

    fn confirm(&self, _question: &str) -> Result<bool> {
        Ok(self.0)
    }
}

/// Never interactive; used for scripted runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

impl Confirm for NonInteractive {
    fn is_interactive(&self) -> bool {
        false
    }

    fn confirm(&self, _question: &str) -> Result<bool> {
        Ok(false)
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
