//! System input observation.
//!
//! On macOS this reads IOKit's HIDIdleTime: no event taps and no
//! Accessibility permission needed. The idle counter resets to zero on any
//! keyboard/mouse/trackpad input, so a reading that went backwards means
//! input happened since the previous poll. Other platforms currently have
//! no system source; the monitor then depends on explicitly reported
//! activity.

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::traits::{InputHandler, InputSource, InputSourceError};

#[cfg(target_os = "macos")]
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

pub struct SystemInputSource {
    cancel: Mutex<Option<CancellationToken>>,
}

impl SystemInputSource {
    pub fn new() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }
}

impl Default for SystemInputSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InputSource for SystemInputSource {
    #[cfg(target_os = "macos")]
    fn start(&self, on_input: InputHandler) -> Result<(), InputSourceError> {
        // Probe once so a missing HID service fails loudly at start instead
        // of silently never reporting input
        iokit::system_idle_seconds().map_err(InputSourceError::Unavailable)?;

        let token = CancellationToken::new();
        {
            let mut slot = self.cancel.lock().unwrap();
            if let Some(old) = slot.replace(token.clone()) {
                old.cancel();
            }
        }

        tokio::spawn(async move {
            let mut last_idle = f64::MAX;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {
                        match iokit::system_idle_seconds() {
                            Ok(idle) => {
                                if idle < last_idle {
                                    on_input();
                                }
                                last_idle = idle;
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "HIDIdleTime read failed (expected in headless sessions)");
                            }
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        });

        tracing::info!("IOKit input source started (1s HIDIdleTime poll)");
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    fn start(&self, _on_input: InputHandler) -> Result<(), InputSourceError> {
        Err(InputSourceError::Unavailable(
            "no system input source on this platform".to_string(),
        ))
    }

    fn stop(&self) {
        if let Some(token) = self.cancel.lock().unwrap().take() {
            token.cancel();
        }
    }
}

/// macOS IOKit FFI for reading system idle time (HIDIdleTime).
#[cfg(target_os = "macos")]
mod iokit {
    use std::ffi::CString;
    use std::os::raw::c_char;

    use core_foundation_sys::base::{kCFAllocatorDefault, CFRelease};
    use core_foundation_sys::number::{kCFNumberSInt64Type, CFNumberGetValue};
    use core_foundation_sys::string::CFStringCreateWithCString;

    #[link(name = "IOKit", kind = "framework")]
    extern "C" {
        fn IOServiceGetMatchingService(master_port: u32, matching: *const core::ffi::c_void) -> u32;
        fn IOServiceMatching(name: *const c_char) -> *mut core::ffi::c_void;
        fn IORegistryEntryCreateCFProperty(
            entry: u32,
            key: *const core::ffi::c_void,
            allocator: *const core::ffi::c_void,
            options: u32,
        ) -> *const core::ffi::c_void;
        fn IOObjectRelease(object: u32) -> i32;
    }

    const K_IO_MASTER_PORT_DEFAULT: u32 = 0;
    const K_CF_STRING_ENCODING_UTF8: u32 = 0x0800_0100;

    /// Seconds since the last user input. Safe to call from any thread.
    pub fn system_idle_seconds() -> Result<f64, String> {
        unsafe {
            let service_name =
                CString::new("IOHIDSystem").map_err(|e| format!("CString error: {}", e))?;
            let matching = IOServiceMatching(service_name.as_ptr());
            if matching.is_null() {
                return Err("IOServiceMatching returned null".to_string());
            }

            // The matching dict is consumed by IOServiceGetMatchingService
            let service = IOServiceGetMatchingService(K_IO_MASTER_PORT_DEFAULT, matching);
            if service == 0 {
                return Err("IOHIDSystem service not found".to_string());
            }

            let key_name =
                CString::new("HIDIdleTime").map_err(|e| format!("CString error: {}", e))?;
            let cf_key = CFStringCreateWithCString(
                kCFAllocatorDefault,
                key_name.as_ptr(),
                K_CF_STRING_ENCODING_UTF8,
            );
            if cf_key.is_null() {
                IOObjectRelease(service);
                return Err("Failed to create CFString for HIDIdleTime".to_string());
            }

            let cf_value =
                IORegistryEntryCreateCFProperty(service, cf_key as *const _, kCFAllocatorDefault, 0);

            CFRelease(cf_key as *const core::ffi::c_void);
            IOObjectRelease(service);

            if cf_value.is_null() {
                return Err("HIDIdleTime property not found".to_string());
            }

            let mut nanoseconds: i64 = 0;
            let success = CFNumberGetValue(
                cf_value as *const _,
                kCFNumberSInt64Type,
                &mut nanoseconds as *mut i64 as *mut core::ffi::c_void,
            );

            CFRelease(cf_value);

            if !success {
                return Err("Failed to extract CFNumber value".to_string());
            }

            Ok(nanoseconds as f64 / 1_000_000_000.0)
        }
    }

}
