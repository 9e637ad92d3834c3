//! Halo-exchange transport seam.

use crate::alloc::Buffer;
use crate::env::Environment;
use crate::error::Result;

/// Moves halo data between neighboring ranks.
///
/// The message format is the transport's business; the context only hands
/// over the communication buffers it allocated and asks for in-flight
/// exchanges to complete.
pub trait HaloTransport: Send {
    /// Exchanges halos and waits until every in-flight message completed.
    ///
    /// # Errors
    ///
    /// Implementations report transport failures through the crate error.
    fn exchange_halos(&mut self, buffers: &mut [Buffer], env: &dyn Environment) -> Result<()>;
}

/// Transport for runs without neighbors. Does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl HaloTransport for NullTransport {
    fn exchange_halos(&mut self, _buffers: &mut [Buffer], _env: &dyn Environment) -> Result<()> {
        Ok(())
    }
}
