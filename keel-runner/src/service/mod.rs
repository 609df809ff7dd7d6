//! Service layer
//!
//! Log buffering shared between the executor and the work functions it runs.
//! The buffer is trait-based so tests and callers can substitute their own.

mod log_buffer;

// Re-export traits
pub use log_buffer::LogBufferService;

// Re-export implementations
pub use log_buffer::{BoundedLogBuffer, DEFAULT_LOG_CAPACITY, LogSink};
