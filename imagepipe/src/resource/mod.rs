//! Reference-counted ownership for pooled resources.
//!
//! Every decoded buffer and every chunk of encoded bytes that flows through
//! the pipeline is wrapped in a [`ResourceHandle`]. Handles share one
//! reference count; the releaser runs exactly once, on whichever thread
//! closes the last open handle.
//!
//! ```text
//!   handle A ──┐
//!   handle B ──┼──► SharedResource { value, count = 3, releaser }
//!   handle C ──┘                                   │
//!                                  last close ─────┘──► releaser.release(&value)
//! ```

mod handle;
mod releaser;

pub use handle::{HandleError, ResourceHandle};
pub use releaser::{NoOpReleaser, ResourceReleaser};
