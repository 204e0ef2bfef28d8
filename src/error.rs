// Veld Error Types
// Compile-time diagnostics are collected and reported in batch; runtime
// errors carry a traceback and abort the current run.

use colored::Colorize;
use thiserror::Error;

/// One compile-time diagnostic, pinned to a file and line.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    pub file: String,
    pub line: usize,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}:{}] {}",
            "error:".red().bold(),
            self.file,
            self.line,
            self.message
        )
    }
}

/// Everything the compiler found wrong with one source unit. The parser
/// synchronizes after each error, so there is usually more than one.
#[derive(Debug, Clone, Error)]
pub struct CompileErrors(pub Vec<Diagnostic>);

impl std::fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (index, diagnostic) in self.0.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", diagnostic)?;
        }
        Ok(())
    }
}

/// One frame of a runtime traceback, innermost first.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub function: String,
    pub module: String,
    pub line: usize,
}

/// A fatal runtime error. The VM resets to an idle state after raising
/// one, so the same context can keep serving a REPL.
#[derive(Debug, Clone, Error)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} {}", "runtime error:".red().bold(), self.message)?;
        for frame in &self.trace {
            writeln!(
                f,
                "    at {} ({}:{})",
                frame.function.bold(),
                frame.module,
                frame.line
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum VeldError {
    #[error("{0}")]
    Compile(#[from] CompileErrors),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
}

impl VeldError {
    /// Process exit code: 65 for bad input, 70 for an internal runtime
    /// failure, matching sysexits.h.
    pub fn exit_code(&self) -> i32 {
        match self {
            VeldError::Compile(_) => 65,
            VeldError::Runtime(_) => 70,
        }
    }
}

pub type VeldResult<T> = Result<T, VeldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_error_classes() {
        let compile = VeldError::Compile(CompileErrors(vec![Diagnostic {
            message: "Expected expression.".into(),
            file: "test".into(),
            line: 1,
        }]));
        let runtime = VeldError::Runtime(RuntimeError {
            message: "Undefined variable 'x'.".into(),
            trace: Vec::new(),
        });
        assert_eq!(compile.exit_code(), 65);
        assert_eq!(runtime.exit_code(), 70);
    }

    #[test]
    fn compile_errors_render_one_per_line() {
        let errors = CompileErrors(vec![
            Diagnostic {
                message: "Expected expression. (near ')')".into(),
                file: "test".into(),
                line: 1,
            },
            Diagnostic {
                message: "Expected ';' after value. (at end)".into(),
                file: "test".into(),
                line: 2,
            },
        ]);
        let rendered = errors.to_string();
        assert_eq!(rendered.lines().count(), 2);
        assert!(rendered.contains("test:1"));
        assert!(rendered.contains("test:2"));
    }
}
