//! Growable device-local buffers

mod growable;
mod pending;

pub use growable::GrowableBuffer;
pub use pending::PendingWrite;
