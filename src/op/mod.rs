//! Operator interface and built-in operators.
//!
//! Operators are opaque to the graph beyond their declared input/output
//! views, relative cost, and capability query. The trait is open: new
//! operator kinds are added over time, unlike the closed buffer storage set.

mod conv;
mod pool;
mod process;
mod upsample;

pub use conv::Conv;
pub use pool::Pool;
pub use process::{InputProcess, OutputProcess};
pub use upsample::Upsample;

use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer::TensorView;
use crate::error::TileResult;
use crate::tensor::{Image, TensorDesc};

/// Shared handle to a tensor view, passed between producer and consumers.
pub type SharedView = Arc<Mutex<TensorView>>;

/// Wrap a view for sharing between operators.
pub fn shared_view(view: TensorView) -> SharedView {
    Arc::new(Mutex::new(view))
}

/// Lock a shared view, converting poisoning into an internal error.
pub(crate) fn lock_view(view: &SharedView) -> TileResult<MutexGuard<'_, TensorView>> {
    view.lock().map_err(Into::into)
}

/// Exchange point for host images at the graph boundary. The caller fills an
/// input slot before `run()` and takes the output slot's image afterwards.
pub type ImageSlot = Arc<Mutex<Option<Image>>>;

/// Create an empty image slot.
pub fn image_slot() -> ImageSlot {
    Arc::new(Mutex::new(None))
}

/// One computational step over memory views.
pub trait Op: Send {
    fn name(&self) -> &str;

    /// Declared relative cost, fixed at build time; used to normalize
    /// progress across operators.
    fn work_amount(&self) -> f64;

    /// Pre-flight capability query. A `false` here surfaces through
    /// [`crate::graph::Graph::is_supported`] before finalize, never during run.
    fn is_supported(&self) -> bool {
        true
    }

    /// Descriptor of the transient output tensor, if the operator produces one.
    fn output_desc(&self) -> Option<TensorDesc> {
        None
    }

    /// Shared handle to the output view (descriptor-only until finalize binds
    /// a concrete address).
    fn output(&self) -> Option<SharedView> {
        None
    }

    /// Layout-dependent setup, invoked by finalize once concrete addresses
    /// exist (e.g. repacking weights into the private region).
    fn finalize_layout(&mut self) -> TileResult<()> {
        Ok(())
    }

    /// Execute the operator. Inputs are valid per execution order; internal
    /// work may be data-parallel, but operators never run concurrently with
    /// each other.
    fn execute(&self) -> TileResult<()>;
}

/// Progress sink for [`crate::graph::Graph::run`].
pub trait Progress {
    /// Receives the normalized completion fraction in `[0, 1]` after each
    /// operator. Returning `false` requests cooperative cancellation before
    /// the next operator starts.
    fn update(&mut self, fraction: f64) -> bool;
}

impl<F: FnMut(f64) -> bool> Progress for F {
    fn update(&mut self, fraction: f64) -> bool {
        self(fraction)
    }
}

/// Progress sink that never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn update(&mut self, _fraction: f64) -> bool {
        true
    }
}

/// Outcome of a graph run. Cancellation is an early-termination outcome with
/// partial completion, distinct from both success and failure; completed
/// operators' effects are not rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled { completed_ops: usize },
}

impl RunOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled { .. })
    }
}

/// Sanitize an input sample: NaN becomes zero, negatives clamp to zero.
pub(crate) fn sanitize(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.max(0.0)
    }
}
