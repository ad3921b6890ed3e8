//! Script preparation and error introspection

use regex::Regex;
use rquickjs::prelude::Coerced;
use rquickjs::Ctx;
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::ExecError;

static LEADING_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*<!--").unwrap());
static TRAILING_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-->\s*$").unwrap());
static STACK_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\d+)(?::(\d+))?\)?\s*$").unwrap());

/// Lines wider than this are cut to a window around the error column
const MAX_CONTEXT_WIDTH: usize = 100;
/// Neighbouring lines wider than this are not shown
const MAX_NEIGHBOUR_WIDTH: usize = 120;

/// Replace HTML comment markers wrapping a page script with JS comments
pub fn strip_comment_markers(script: &str) -> String {
    let script = LEADING_COMMENT.replace(script, "//");
    TRAILING_COMMENT.replace(&script, "//").into_owned()
}

/// An exception taken off the engine
#[derive(Debug, Clone, Default)]
pub struct CaughtException {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl CaughtException {
    /// Take (and clear) the pending exception
    pub fn take(ctx: &Ctx<'_>) -> Self {
        let value = ctx.catch();

        if let Some(exception) = value.as_exception() {
            let name = value
                .as_object()
                .and_then(|object| object.get::<_, Option<String>>("name").ok().flatten())
                .unwrap_or_else(|| "Error".to_string());
            return Self {
                name,
                message: exception.message().unwrap_or_default(),
                stack: exception.stack(),
            };
        }

        let message = value
            .get::<Coerced<String>>()
            .map(|text| text.0)
            .unwrap_or_else(|_| "unknown exception".to_string());
        Self {
            name: "Uncaught".to_string(),
            message,
            stack: None,
        }
    }

    pub fn summary(&self) -> String {
        if self.message.is_empty() {
            self.name.clone()
        } else {
            format!("{}: {}", self.name, self.message)
        }
    }

    pub fn location(&self) -> (Option<u32>, Option<u32>) {
        self.stack
            .as_deref()
            .map(parse_location)
            .unwrap_or((None, None))
    }
}

/// First `line[:column]` found in a stack trace
pub fn parse_location(stack: &str) -> (Option<u32>, Option<u32>) {
    for line in stack.lines() {
        if let Some(captures) = STACK_LOCATION.captures(line) {
            let line = captures.get(1).and_then(|m| m.as_str().parse().ok());
            let column = captures.get(2).and_then(|m| m.as_str().parse().ok());
            return (line, column);
        }
    }
    (None, None)
}

/// Turn an engine failure into an `ExecError`, logging source context for runtime errors
pub fn classify(
    ctx: &Ctx<'_>,
    err: rquickjs::Error,
    interrupted: bool,
    elapsed: Duration,
    script: &str,
) -> ExecError {
    let caught = matches!(err, rquickjs::Error::Exception).then(|| CaughtException::take(ctx));

    if interrupted {
        return ExecError::Interrupted { elapsed };
    }

    let Some(caught) = caught else {
        return ExecError::Runtime {
            message: err.to_string(),
            line: None,
            column: None,
        };
    };

    if caught.name == "SyntaxError" {
        return ExecError::Compile(caught.summary());
    }

    let (line, column) = caught.location();
    if let Some(line) = line {
        for context_line in error_context(script, line, column) {
            tracing::debug!("{}", context_line);
        }
    }
    ExecError::Runtime {
        message: caught.summary(),
        line,
        column,
    }
}

/// The failing line plus one line either side (1-based numbering)
pub fn error_context(script: &str, line: u32, column: Option<u32>) -> Vec<String> {
    let lines: Vec<&str> = script.lines().collect();
    let y = line as usize;
    if y == 0 || y > lines.len() {
        return Vec::new();
    }

    let whole = lines[y - 1];
    if whole.chars().count() > MAX_CONTEXT_WIDTH {
        let x = column.unwrap_or(1).saturating_sub(1) as usize;
        let from = x.saturating_sub(MAX_CONTEXT_WIDTH / 2);
        let snippet: String = whole
            .chars()
            .skip(from)
            .take(MAX_CONTEXT_WIDTH)
            .collect();
        return vec![format!("{}: {}", y, snippet)];
    }

    (y.saturating_sub(1)..=y + 1)
        .filter(|&n| n >= 1 && n <= lines.len())
        .filter(|&n| n == y || lines[n - 1].len() < MAX_NEIGHBOUR_WIDTH)
        .map(|n| format!("{}: {}", n, lines[n - 1]))
        .collect()
}
