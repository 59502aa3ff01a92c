//! User input source trait for idle detection

use std::sync::Arc;
use thiserror::Error;

/// Callback invoked on every observed input event. Must be cheap: it only
/// bumps the last-activity timestamp.
pub type InputHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Error)]
pub enum InputSourceError {
    #[error("input source unavailable: {0}")]
    Unavailable(String),
}

/// Trait for observing user input (pointer, keyboard, scroll, touch)
///
/// Production: IOKit HIDIdleTime polling on macOS
/// Testing: manually simulated input
///
/// The idle monitor starts the source lazily on the first subscriber and
/// stops it when the last one unregisters; `stop` must be idempotent.
pub trait InputSource: Send + Sync {
    fn start(&self, on_input: InputHandler) -> Result<(), InputSourceError>;
    fn stop(&self);
}
