use std::any::{type_name, Any};
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use serde_derive::{Deserialize, Serialize};

/// Category of failures caused by a panic in the worker.
pub const PANIC_CATEGORY: &str = "panic";

/// A failure that happened in a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// The error type name, or [`PANIC_CATEGORY`].
    pub category: String,
    pub message: String,
    /// Source chain of an error, or location and backtrace of a panic.
    pub trace: Vec<String>,
}

impl RemoteError {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError {
            category: category.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn from_error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        let mut trace = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        RemoteError {
            category: type_name::<E>().to_string(),
            message: err.to_string(),
            trace,
        }
    }

    pub fn is_panic(&self) -> bool {
        self.category == PANIC_CATEGORY
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// The result frame a worker sends after its globals frame. A failure is
/// followed by one more frame holding the trace.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Outcome<T> {
    Returned(T),
    Failed { category: String, message: String },
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<Vec<String>>> = RefCell::new(None);
}

/// Records where the next panic happens, for [`catch`].
pub(crate) fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let mut trace = Vec::new();
        if let Some(location) = info.location() {
            trace.push(format!("panicked at {}:{}:{}", location.file(), location.line(), location.column()));
        }
        let backtrace = Backtrace::force_capture().to_string();
        trace.extend(backtrace.lines().map(|line| line.trim_end().to_string()));
        PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
    }));
}

/// Runs `f`, turning a panic into a [`RemoteError`].
pub(crate) fn catch<R>(f: impl FnOnce() -> R) -> Result<R, RemoteError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| RemoteError {
        category: PANIC_CATEGORY.to_string(),
        message: panic_message(payload.as_ref()),
        trace: PANIC_TRACE
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_default(),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}
