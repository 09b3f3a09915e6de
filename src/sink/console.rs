use std::io::{self, Write};

/// Standard stream a console sink writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

impl ConsoleStream {
    /// `STDERR` in any case selects standard error, anything else stdout
    pub fn from_target(target: &str) -> Self {
        if target.trim().eq_ignore_ascii_case("stderr") {
            ConsoleStream::Stderr
        } else {
            ConsoleStream::Stdout
        }
    }

    pub(crate) fn writer(self) -> Box<dyn Write + Send> {
        match self {
            ConsoleStream::Stdout => Box::new(io::stdout()),
            ConsoleStream::Stderr => Box::new(io::stderr()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_match_is_case_insensitive() {
        assert_eq!(ConsoleStream::from_target("STDERR"), ConsoleStream::Stderr);
        assert_eq!(ConsoleStream::from_target("stderr"), ConsoleStream::Stderr);
        assert_eq!(ConsoleStream::from_target("StdErr"), ConsoleStream::Stderr);
        assert_eq!(ConsoleStream::from_target("STDOUT"), ConsoleStream::Stdout);
        assert_eq!(ConsoleStream::from_target(""), ConsoleStream::Stdout);
        assert_eq!(ConsoleStream::from_target("report.csv"), ConsoleStream::Stdout);
    }
}
