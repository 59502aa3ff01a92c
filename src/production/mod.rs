//! Production implementations of the external-dependency traits.

mod backend_client;
mod input_source;
mod screenshot;
mod window_inspector;

pub use backend_client::HttpBackendClient;
pub use input_source::SystemInputSource;
pub use screenshot::ScreenCaptureProvider;
pub use window_inspector::SystemWindowInspector;
