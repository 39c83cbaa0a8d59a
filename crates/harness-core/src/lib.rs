#![forbid(unsafe_code)]
//! Processor side of the shared-memory harness protocol.
//!
//! A processor connects to a driver over a Unix socket, announces itself,
//! attaches an input and an output shared-memory region, learns which
//! [`Method`] to run, and then serves requests until the driver goes away or
//! the process is asked to stop:
//!
//! ```text
//! driver                                processor
//!   |  <---------- identity ----------------  |
//!   |  ----------- [input id] ------------>   |   (variant dependent)
//!   |  ----------- output key/id --------->   |
//!   |  ----------- [method name] --------->   |   (variant dependent)
//!   |                                         |
//!   |  payload -> input region @0             |
//!   |  ----------- u32 length ------------>   |
//!   |                     output region @0 <- digest
//!   |  <---------- u32 length -------------   |
//! ```
//!
//! Integers on the control channel are 4-byte big-endian. Payloads never
//! cross the socket.

mod cancel;
mod channel;
mod config;
mod error;
mod method;
mod resources;
mod session;

pub use cancel::*;
pub use channel::*;
pub use config::*;
pub use error::*;
pub use method::*;
pub use resources::*;
pub use session::*;

pub use harness_shm::{HeapNamespace, Namespace, Ownership, Role, SharedMemoryRegion};
