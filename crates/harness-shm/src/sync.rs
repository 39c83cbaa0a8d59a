#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "loom")]
pub use loom::thread;
#[cfg(all(not(feature = "loom"), test))]
pub use std::thread;
