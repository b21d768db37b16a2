//! Performance logging macros
//!
//! Used to time the inference and rendering steps of a sighting in debug
//! builds; they compile to no-ops in release builds.

/// Performance debug logging - only active in debug builds
#[cfg(debug_assertions)]
#[macro_export]
macro_rules! perf_debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}

/// Performance debug logging - no-op in release builds
#[cfg(not(debug_assertions))]
#[macro_export]
macro_rules! perf_debug {
    ($($arg:tt)*) => {};
}
