/// `error.rs` — structured errors for the extension host
///
/// Every script-side failure is converted into an `ElgError` carrying the
/// call site (extension, function or event) and the underlying message.
use std::{io, path::PathBuf, sync::Arc};

use thiserror::Error;

/// Severity classes of host errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Runtime creation, uncaught script errors, unsupported return values.
    Fatal,
    /// Missing/unreadable source, compile error, priming error, missing function.
    Load,
    /// Recoverable conditions the engine may choose to ignore.
    Soft,
}

#[derive(Debug, Error)]
pub enum ElgError {
    #[error("failed to create a new scripting runtime: {0}")]
    RuntimeCreation(#[source] mlua::Error),

    #[error("the scripting runtime is not running")]
    NotRunning,

    #[error("error running the initialization script {name}: {message}")]
    Bootstrap { name: String, message: String },

    #[error("error loading @{extension}: {} doesn't exist", .path.display())]
    ExtensionNotFound { extension: String, path: PathBuf },

    #[error("error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error compiling @{extension}: {message}")]
    Compile { extension: String, message: String },

    #[error("error loading @{extension}: {message}")]
    Priming { extension: String, message: String },

    #[error("error loading @{function}, function doesn't exist in extension {extension}")]
    MissingFunction { extension: String, function: String },

    #[error("error calling @{event} in {extension}: {message}")]
    Event {
        extension: String,
        event: String,
        message: String,
    },

    #[error("@{event} expects {expected} argument(s), got {found}")]
    Arity {
        event: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("error calling the {event}, it must return an integer (got {found})")]
    BadIndex { event: &'static str, found: String },

    #[error("token_event proposed index {index} outside the buffer (size {size})")]
    AdvanceOutOfBounds { index: i64, size: usize },

    #[error("position {index} is outside the token buffer (size {size})")]
    PositionOutOfBuffer { index: i64, size: usize },

    #[error("error calling @{function}: {message}")]
    Call { function: String, message: String },

    #[error(
        "error calling @{function}, function must return a boolean, a number, a string or a null value (got {found})"
    )]
    UnsupportedReturn {
        function: String,
        found: &'static str,
    },

    #[error("error calling @{function}, returned string is not valid UTF-8")]
    InvalidUtf8 { function: String },

    #[error("invalid configuration {}: {message}", .path.display())]
    Config { path: PathBuf, message: String },

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

impl ElgError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ElgError::ExtensionNotFound { .. }
            | ElgError::Io { .. }
            | ElgError::Compile { .. }
            | ElgError::Priming { .. }
            | ElgError::MissingFunction { .. }
            | ElgError::Config { .. } => ErrorClass::Load,
            ElgError::AdvanceOutOfBounds { .. } | ElgError::NotRunning => ErrorClass::Soft,
            ElgError::RuntimeCreation(_)
            | ElgError::Bootstrap { .. }
            | ElgError::Event { .. }
            | ElgError::Arity { .. }
            | ElgError::BadIndex { .. }
            | ElgError::PositionOutOfBuffer { .. }
            | ElgError::Call { .. }
            | ElgError::UnsupportedReturn { .. }
            | ElgError::InvalidUtf8 { .. }
            | ElgError::Lua(_) => ErrorClass::Fatal,
        }
    }
}

/// Callback invoked by [`Session::fatal`](crate::scripting::engine::Session::fatal).
pub type FatalHandler = Arc<dyn Fn(&ElgError) + Send + Sync>;

/// Default fatal handler: report the diagnostic and abort the process.
pub fn abort_handler() -> FatalHandler {
    Arc::new(|err: &ElgError| {
        log::error!("[elg] fatal: {err}");
        eprintln!("{err}");
        std::process::abort();
    })
}

/// Render an mlua error as the innermost script message.
///
/// Callback errors wrap the script error with a traceback; the cause is what
/// a script author wants to read.
pub(crate) fn script_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => script_message(cause),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::RuntimeError(message) => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_errors_are_classified_as_load() {
        let err = ElgError::MissingFunction {
            extension: "dates".into(),
            function: "year".into(),
        };
        assert_eq!(err.class(), ErrorClass::Load);
        assert_eq!(
            err.to_string(),
            "error loading @year, function doesn't exist in extension dates"
        );
    }

    #[test]
    fn unsupported_return_is_fatal_and_names_function() {
        let err = ElgError::UnsupportedReturn {
            function: "split".into(),
            found: "table",
        };
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(err.to_string().contains("@split"));
        assert!(err.to_string().contains("table"));
    }

    #[test]
    fn script_message_unwraps_callback_errors() {
        let inner = mlua::Error::RuntimeError("boom".into());
        let wrapped = mlua::Error::CallbackError {
            traceback: "stack traceback:".into(),
            cause: Arc::new(inner),
        };
        assert_eq!(script_message(&wrapped), "boom");
    }
}
