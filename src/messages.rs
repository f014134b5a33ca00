use anyhow::Error;
use colored::*;
use std::fmt::Display;
use std::path::PathBuf;

/// A single positioned diagnostic reported during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMessage {
    pub message: String,
    pub file: Option<PathBuf>,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl Display for BuildMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", "error:".red().bold(), self.message)?;
        if let Some(file) = self.file.as_ref() {
            write!(f, " ({}", file.display())?;
            if let Some(line) = self.line {
                write!(f, ":{}", line)?;
                if let Some(column) = self.column {
                    write!(f, ":{}", column)?;
                }
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Non-throwing diagnostic channel. Errors are accumulated during the
/// scan and rendered by the caller once the walk has finished.
#[derive(Debug, Default)]
pub struct BuildMessages {
    messages: Vec<BuildMessage>,
}

impl BuildMessages {
    pub fn new() -> BuildMessages {
        BuildMessages::default()
    }

    pub fn error(
        &mut self,
        message: impl Into<String>,
        file: Option<PathBuf>,
        line: Option<usize>,
        column: Option<usize>,
    ) {
        self.messages.push(BuildMessage {
            message: message.into(),
            file,
            line,
            column,
        });
    }

    pub fn push(&mut self, message: BuildMessage) {
        self.messages.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BuildMessage> {
        self.messages.iter()
    }
}

/// One-line rendering for errors outside the per-file diagnostic flow,
/// e.g. an unreadable entry file or a failed output write.
pub fn render_scan_error(error: &Error) -> String {
    format!("{} {:#}", "scan failed:".red().bold(), error)
}

/// Errors the scan cannot recover from abort the process, unlike the
/// accumulated per-file diagnostics above.
pub fn fatal(error: Error) -> ! {
    eprintln!("{}", render_scan_error(&error));
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::BuildMessages;
    use std::path::PathBuf;

    #[test]
    fn accumulates_in_order() {
        let mut messages = BuildMessages::new();
        assert!(messages.is_empty());

        messages.error("first", None, None, None);
        messages.error(
            "second",
            Some(PathBuf::from("main.js")),
            Some(3),
            Some(14),
        );

        assert_eq!(messages.len(), 2);
        let collected: Vec<_> = messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(collected, vec!["first", "second"]);
    }
}
