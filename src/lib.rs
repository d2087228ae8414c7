//! TileForge - tiled operator-graph executor
//!
//! A static operator-graph executor for tiled neural-network inference over
//! heterogeneous memory. Graphs are built from convolution, pooling,
//! upsampling, and boundary operators, finalized against a planned scratch
//! arena, and executed in registration order with progress reporting and
//! cooperative cancellation.

#![allow(clippy::too_many_arguments)] // Operator constructors take full wiring
#![allow(clippy::needless_range_loop)] // Clearer for tile loops

pub mod buffer;
pub mod engine;
pub mod error;
pub mod graph;
pub mod logging;
pub mod op;
pub mod planner;
pub mod tensor;

pub use buffer::{Access, Buffer, Storage, SyncMode, TensorView};
pub use engine::{CpuEngine, Engine};
pub use error::{ErrorCategory, TileForgeError, TileResult};
pub use graph::{Graph, OpId};
pub use op::{image_slot, NoProgress, Progress, RunOutcome};
pub use planner::{ArenaPlan, ArenaPlanner};
pub use tensor::{DataType, HostTensor, Image, TensorDesc, MEM_ALIGNMENT};
