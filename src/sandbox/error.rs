//! Sandbox errors

use std::fmt;
use std::path::PathBuf;

/// Failure to turn a script source into a usable context
#[derive(Debug)]
pub enum ScriptLoadError {
    /// The script file could not be read
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The source is not a valid module
    Compile(String),
    /// Instantiation failed (unknown import, memory limit)
    Instantiate(String),
    /// A required export is missing or has the wrong signature
    MissingExport(&'static str),
    /// The top level (start function or `init`) trapped
    Trap(String),
    /// Top-level evaluation exceeded the load timeout
    Timeout,
    /// The blocking worker running the load died
    Worker(String),
}

impl fmt::Display for ScriptLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptLoadError::Read { path, source } => {
                write!(f, "cannot read script {}: {}", path.display(), source)
            }
            ScriptLoadError::Compile(msg) => write!(f, "compile error: {}", msg),
            ScriptLoadError::Instantiate(msg) => write!(f, "instantiation failed: {}", msg),
            ScriptLoadError::MissingExport(name) => {
                write!(f, "export '{}' is missing or has the wrong signature", name)
            }
            ScriptLoadError::Trap(msg) => write!(f, "script trapped during load: {}", msg),
            ScriptLoadError::Timeout => write!(f, "script load timed out"),
            ScriptLoadError::Worker(msg) => write!(f, "load worker failed: {}", msg),
        }
    }
}

impl std::error::Error for ScriptLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScriptLoadError::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Failure of a single transform invocation
#[derive(Debug)]
pub enum ScriptRuntimeError {
    /// The handler ran past the run timeout
    Timeout,
    /// The guest trapped or a capability call failed
    Trap(String),
    /// The handler returned a negative status
    AbnormalStatus(i32),
    /// More messages were published than the outbound queue holds
    QueueOverflow(usize),
    /// The guest handed back an unusable buffer
    Guest(String),
    /// The blocking worker running the handler died
    Worker(String),
}

impl ScriptRuntimeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ScriptRuntimeError::Timeout)
    }
}

impl fmt::Display for ScriptRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptRuntimeError::Timeout => write!(f, "handler timed out"),
            ScriptRuntimeError::Trap(msg) => write!(f, "handler trapped: {}", msg),
            ScriptRuntimeError::AbnormalStatus(code) => {
                write!(f, "handler returned abnormal status {}", code)
            }
            ScriptRuntimeError::QueueOverflow(max) => {
                write!(f, "outbound queue overflow (max {})", max)
            }
            ScriptRuntimeError::Guest(msg) => write!(f, "guest error: {}", msg),
            ScriptRuntimeError::Worker(msg) => write!(f, "run worker failed: {}", msg),
        }
    }
}

impl std::error::Error for ScriptRuntimeError {}
