//! Runtime error reporting.

use std::fmt;

/// One runtime fault: the source line the failing instruction was compiled
/// from, a message, and the call stack unwound at the point of failure —
/// the same shape a frame-walk print gives a user in the original, kept as
/// a plain value type rather than a panic because the VM only ever does
/// one thing with it: print to stderr and exit 70.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub line: u32,
    pub message: String,
    /// Function names, innermost first, active when the fault occurred.
    pub trace: Vec<String>,
}

impl RuntimeError {
    pub fn new(line: u32, message: impl Into<String>, trace: Vec<String>) -> Self {
        RuntimeError {
            line,
            message: message.into(),
            trace,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[line {}] Error: {}", self.line, self.message)?;
        for name in &self.trace {
            writeln!(f, "  at {name}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_line_and_trace() {
        let err = RuntimeError::new(12, "division by zero", vec!["main".into(), "helper".into()]);
        let rendered = err.to_string();
        assert!(rendered.contains("[line 12]"));
        assert!(rendered.contains("division by zero"));
        assert!(rendered.contains("at main"));
        assert!(rendered.contains("at helper"));
    }
}
