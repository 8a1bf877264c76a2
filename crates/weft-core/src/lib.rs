//! # weft-core
//!
//! Leaf types shared across the weft runtime crates: fiber state, the
//! readiness-event bitset, monotonic clock sampling, environment helpers,
//! error types, the startup semaphore, and the segmented byte buffer.
//!
//! Nothing in this crate switches contexts or touches the scheduler; it is
//! the dependency floor everything else stands on.

pub mod bytearray;
pub mod env;
pub mod error;
pub mod event;
pub mod state;
pub mod sync;
pub mod time;

pub use bytearray::{ByteArray, Endian};
pub use env::{env_get, env_get_bool};
pub use error::{BufferError, RuntimeError, RuntimeResult};
pub use event::EventSet;
pub use state::FiberState;
pub use sync::Semaphore;
pub use time::elapsed_ms;
