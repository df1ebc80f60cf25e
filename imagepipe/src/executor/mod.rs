//! Named executor pools and the thread hand-off queue.
//!
//! Pipeline stages never block the caller. Work is moved onto one of the
//! pools named by [`ExecutorSupplier`]:
//!
//! | Pool | Used for |
//! |------|----------|
//! | network | HTTP fetches |
//! | local storage read | disk cache reads, local file reads |
//! | local storage write | disk cache writes |
//! | decode | image decoding, postprocessing |
//! | background | index population, thumbnails |
//! | lightweight background | hand-off queue (serial) |
//! | ui | consumer-facing delivery |

mod handoff;
mod pool;
mod supplier;

pub use handoff::{TaskId, ThreadHandoffQueue};
pub use pool::{submit, Executor, InlineExecutor, PoolExecutor, SerialExecutor, Task};
pub use supplier::{ExecutorConfig, ExecutorSupplier, InlineExecutorSupplier, TokioExecutorSupplier};
