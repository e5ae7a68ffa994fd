//! Sources of per-iteration user instructions.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};

/// Asked once per iteration when per-iteration instructions are enabled.
pub trait UserInputSource: Send {
    /// Fresh input for `iteration`, or `None` when the user gives nothing.
    fn prompt(&mut self, iteration: u32) -> Result<Option<String>>;
}

/// Never provides input.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUserInput;

impl UserInputSource for NoUserInput {
    fn prompt(&mut self, _iteration: u32) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Reads one line from stdin after printing a prompt on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinUserInput;

impl UserInputSource for StdinUserInput {
    fn prompt(&mut self, iteration: u32) -> Result<Option<String>> {
        let mut stderr = std::io::stderr().lock();
        write!(
            stderr,
            "Instructions for iteration {iteration} (empty line to skip): "
        )
        .context("write user prompt")?;
        stderr.flush().context("flush user prompt")?;
        read_line(std::io::stdin().lock())
    }
}

fn read_line(mut reader: impl BufRead) -> Result<Option<String>> {
    let mut line = String::new();
    reader.read_line(&mut line).context("read user input")?;
    let trimmed = line.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

/// Input for `iteration` given the run's initial input and whether fresh
/// instructions are collected every iteration.
pub fn iteration_input(
    initial: Option<&str>,
    per_iteration: bool,
    iteration: u32,
    source: &mut dyn UserInputSource,
) -> Result<String> {
    let initial = initial.unwrap_or_default().trim();
    if iteration == 0 || !per_iteration {
        return Ok(initial.to_string());
    }
    let fresh = source.prompt(iteration)?.unwrap_or_default();
    Ok(match (initial.is_empty(), fresh.is_empty()) {
        (_, true) => initial.to_string(),
        (true, false) => fresh,
        (false, false) => format!("{initial}\n{fresh}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    impl UserInputSource for Fixed {
        fn prompt(&mut self, _iteration: u32) -> Result<Option<String>> {
            Ok(Some(self.0.to_string()))
        }
    }

    #[test]
    fn first_iteration_uses_initial_input_only() {
        let out = iteration_input(Some("use f1"), true, 0, &mut Fixed("more")).expect("input");
        assert_eq!(out, "use f1");
    }

    #[test]
    fn later_iterations_concatenate_when_enabled() {
        let out = iteration_input(Some("use f1"), true, 2, &mut Fixed("more")).expect("input");
        assert_eq!(out, "use f1\nmore");
        let out = iteration_input(None, true, 2, &mut Fixed("more")).expect("input");
        assert_eq!(out, "more");
    }

    #[test]
    fn later_iterations_reuse_initial_when_disabled() {
        let out = iteration_input(Some("use f1"), false, 5, &mut Fixed("ignored")).expect("input");
        assert_eq!(out, "use f1");
        assert_eq!(iteration_input(None, true, 1, &mut NoUserInput).expect("input"), "");
    }

    #[test]
    fn read_line_trims_and_treats_blank_as_none() {
        assert_eq!(read_line("  hi \n".as_bytes()).expect("read"), Some("hi".to_string()));
        assert_eq!(read_line("\n".as_bytes()).expect("read"), None);
    }
}
