//! Trait definitions for dependency injection
//!
//! All external dependencies are abstracted behind traits to enable testing.

mod backend_client;
mod delivery_ledger;
mod input_source;
mod screenshot;
mod window_inspector;

pub use backend_client::{BackendClient, BackendError, EntryOutcome};
pub use delivery_ledger::{DeliveryLedgerTrait, DeliveryStatus, LedgerError, LedgerStats, QueueEntry};
pub use input_source::{InputHandler, InputSource, InputSourceError};
pub use screenshot::{ScreenshotError, ScreenshotProvider, ScreenshotUpload};
pub use window_inspector::{ActiveWindow, InspectorError, WindowInspector};

#[cfg(test)]
pub use backend_client::MockBackendClient;
