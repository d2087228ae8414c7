//! Operator graph: build, finalize, run.
//!
//! Two-phase construction: the build phase registers operators and
//! descriptor-only views, recording a scratch request and a deferred-binding
//! record per transient output. `finalize` plans the scratch arena, sizes the
//! backing buffer, and replays the deferred bindings so every view gets a
//! concrete buffer+offset before the first run. Execution order is
//! registration order, which is topological by construction: sources must
//! already be members when an operator is added.

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::{Buffer, Storage, TensorView};
use crate::engine::Engine;
use crate::error::{TileForgeError, TileResult};
use crate::op::{
    image_slot, lock_view, shared_view, Conv, ImageSlot, InputProcess, Op, OutputProcess, Pool,
    Progress, RunOutcome, SharedView, Upsample,
};
use crate::planner::{ArenaPlan, ArenaPlanner};
use crate::tensor::{align_up, DataType, HostTensor, TensorDesc};
use crate::{unsupported_error, usage_error};

/// Handle to an operator registered in a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpId(pub usize);

/// One transient output: descriptor, planner allocation id, and lifetime over
/// the operator order. `last_op` is extended as later operators reference the
/// producing operator.
#[derive(Debug)]
struct AllocRecord {
    id: usize,
    byte_size: usize,
    first_op: usize,
    last_op: usize,
}

/// Deferred binding: views to attach to the scratch buffer once planning has
/// resolved concrete offsets. Private offsets are relative to the private
/// region, which starts after the scratch region.
struct DeferredBinding {
    op_index: usize,
    scratch: Option<(SharedView, usize)>,
    privates: Vec<(SharedView, usize)>,
}

/// Static operator DAG with scratch planning and progress-reporting execution.
pub struct Graph {
    engine: Arc<dyn Engine>,
    const_tensors: HashMap<String, HostTensor>,
    ops: Vec<Box<dyn Op>>,
    records: Vec<AllocRecord>,
    /// Producing op index -> record index, for lifetime extension.
    op_alloc: HashMap<usize, usize>,
    bindings: Vec<DeferredBinding>,
    scratch: Option<Buffer>,
    external_scratch: bool,
    scratch_byte_size: usize,
    private_byte_size: usize,
    next_alloc_id: usize,
    dirty: bool,
    finalized: bool,
}

impl Graph {
    pub fn new(engine: Arc<dyn Engine>, const_tensors: HashMap<String, HostTensor>) -> Self {
        Self {
            engine,
            const_tensors,
            ops: Vec::new(),
            records: Vec::new(),
            op_alloc: HashMap::new(),
            bindings: Vec::new(),
            scratch: None,
            external_scratch: false,
            scratch_byte_size: 0,
            private_byte_size: 0,
            next_alloc_id: 0,
            dirty: false,
            finalized: false,
        }
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized && !self.dirty
    }

    /// Sum of every operator's declared relative cost, fixed at build time.
    pub fn work_amount(&self) -> f64 {
        self.ops.iter().map(|op| op.work_amount()).sum()
    }

    /// Pre-flight capability check: every registered operator must be
    /// realizable before finalize is attempted.
    pub fn is_supported(&self) -> bool {
        self.engine.supports_storage(Storage::Managed)
            && self.ops.iter().all(|op| op.is_supported())
    }

    /// Total transient bytes the scratch plan requires.
    pub fn scratch_byte_size(&self) -> usize {
        self.plan_scratch()
            .map(|plan| plan.total_byte_size())
            .unwrap_or(0)
    }

    /// Total persistent bytes (constant tensors), never aliased with scratch.
    pub fn private_byte_size(&self) -> usize {
        self.private_byte_size
    }

    fn plan_scratch(&self) -> TileResult<ArenaPlan> {
        let mut planner = ArenaPlanner::new();
        for record in &self.records {
            planner.register(record.id, record.byte_size, record.first_op, record.last_op)?;
        }
        Ok(planner.plan())
    }

    fn source(&mut self, src: OpId) -> TileResult<(SharedView, TensorDesc)> {
        let op = self
            .ops
            .get(src.0)
            .ok_or_else(|| usage_error!("source operator {} is not a graph member", src.0))?;
        let view = op
            .output()
            .ok_or_else(|| usage_error!("operator '{}' has no output tensor", op.name()))?;
        let desc = op
            .output_desc()
            .ok_or_else(|| usage_error!("operator '{}' has no output descriptor", op.name()))?;
        // The new operator will sit at index ops.len(); the source's transient
        // output must stay live until then.
        let consumer = self.ops.len();
        if let Some(&record) = self.op_alloc.get(&src.0) {
            self.records[record].last_op = self.records[record].last_op.max(consumer);
        }
        Ok((view, desc))
    }

    fn push_producer(
        &mut self,
        op: Box<dyn Op>,
        dst: SharedView,
        desc: &TensorDesc,
        privates: Vec<(SharedView, usize)>,
    ) -> TileResult<OpId> {
        if desc.byte_size() == 0 {
            return Err(usage_error!(
                "operator '{}' declares an empty output tensor",
                op.name()
            ));
        }
        let index = self.ops.len();
        let id = self.next_alloc_id;
        self.next_alloc_id += 1;
        self.records.push(AllocRecord {
            id,
            byte_size: desc.byte_size(),
            first_op: index,
            last_op: index,
        });
        self.op_alloc.insert(index, self.records.len() - 1);
        self.bindings.push(DeferredBinding {
            op_index: index,
            scratch: Some((dst, id)),
            privates,
        });
        self.ops.push(op);
        self.dirty = true;
        Ok(OpId(index))
    }

    fn push_sink(&mut self, op: Box<dyn Op>) -> OpId {
        let index = self.ops.len();
        self.ops.push(op);
        self.dirty = true;
        OpId(index)
    }

    /// Reserve a private (persistent) range and return its region-relative
    /// offset plus the unbacked view over it.
    fn reserve_private(&mut self, desc: TensorDesc) -> (SharedView, usize) {
        let offset = self.private_byte_size;
        self.private_byte_size += align_up(desc.byte_size());
        (shared_view(TensorView::unbacked(desc)), offset)
    }

    fn lookup_const(&self, name: &str) -> TileResult<HostTensor> {
        self.const_tensors
            .get(name)
            .cloned()
            .ok_or_else(|| unsupported_error!("constant tensor '{}' not found", name))
    }

    // ---------------------------------------------------------------------
    // Build phase
    // ---------------------------------------------------------------------

    /// Add the input boundary operator producing a `channels`x`height`x`width`
    /// tensor. Returns the op handle and the slot the caller fills with the
    /// source image before each run.
    pub fn add_input_process(
        &mut self,
        name: impl Into<String>,
        channels: usize,
        height: usize,
        width: usize,
    ) -> TileResult<(OpId, ImageSlot)> {
        let desc = TensorDesc::chw(channels, height, width);
        let dst = shared_view(TensorView::unbacked(desc.clone()));
        let slot = image_slot();
        let op = Box::new(InputProcess::new(name, dst.clone(), slot.clone()));
        let id = self.push_producer(op, dst, &desc, Vec::new())?;
        Ok((id, slot))
    }

    /// Add the output boundary operator reading `src`'s tensor back into a
    /// host image available from the returned slot after each run.
    pub fn add_output_process(
        &mut self,
        name: impl Into<String>,
        src: OpId,
    ) -> TileResult<(OpId, ImageSlot)> {
        let (view, _desc) = self.source(src)?;
        let slot = image_slot();
        let op = Box::new(OutputProcess::new(name, view, slot.clone()));
        Ok((self.push_sink(op), slot))
    }

    /// Add a 3x3 convolution. Weights come from the constant tensors
    /// `{name}.weight` ([out_c, in_c, 3, 3]) and `{name}.bias` ([out_c]).
    pub fn add_conv(&mut self, name: &str, src: OpId, relu: bool) -> TileResult<OpId> {
        let (view, desc) = self.source(src)?;
        self.add_conv_impl(name, vec![(view, desc)], relu)
    }

    /// Add a convolution over the channel concatenation of two sources.
    pub fn add_concat_conv(
        &mut self,
        name: &str,
        src1: OpId,
        src2: OpId,
        relu: bool,
    ) -> TileResult<OpId> {
        let (view1, desc1) = self.source(src1)?;
        let (view2, desc2) = self.source(src2)?;
        if desc1.height() != desc2.height() || desc1.width() != desc2.width() {
            return Err(unsupported_error!(
                "concat sources of '{}' have mismatched tile shapes {}x{} vs {}x{}",
                name,
                desc1.height(),
                desc1.width(),
                desc2.height(),
                desc2.width()
            ));
        }
        self.add_conv_impl(name, vec![(view1, desc1), (view2, desc2)], relu)
    }

    fn add_conv_impl(
        &mut self,
        name: &str,
        srcs: Vec<(SharedView, TensorDesc)>,
        relu: bool,
    ) -> TileResult<OpId> {
        let weight = self.lookup_const(&format!("{}.weight", name))?;
        let bias = self.lookup_const(&format!("{}.bias", name))?;

        let in_channels: usize = srcs.iter().map(|(_, d)| d.channels()).sum();
        if weight.desc.ndims() != 4 || weight.desc.dims[2] != 3 || weight.desc.dims[3] != 3 {
            return Err(unsupported_error!(
                "'{}' weight shape {:?} is not a 3x3 kernel",
                name,
                weight.desc.dims
            ));
        }
        if weight.desc.dims[1] != in_channels {
            return Err(unsupported_error!(
                "'{}' expects {} input channels, sources provide {}",
                name,
                weight.desc.dims[1],
                in_channels
            ));
        }
        let out_channels = weight.desc.dims[0];
        if bias.desc.ndims() != 1 || bias.desc.dims[0] != out_channels {
            return Err(unsupported_error!(
                "'{}' bias shape {:?} does not match {} output channels",
                name,
                bias.desc.dims,
                out_channels
            ));
        }

        let (height, width) = (srcs[0].1.height(), srcs[0].1.width());
        let out_desc = TensorDesc::chw(out_channels, height, width);
        let dst = shared_view(TensorView::unbacked(out_desc.clone()));

        // Private ranges hold f32 data regardless of the host dtype; f16
        // weights are widened on upload.
        let (weight_view, weight_off) =
            self.reserve_private(TensorDesc::new(weight.desc.dims.clone(), DataType::F32));
        let (bias_view, bias_off) =
            self.reserve_private(TensorDesc::new(bias.desc.dims.clone(), DataType::F32));

        let work = (out_desc.element_count() * in_channels * 9) as f64;
        let views: Vec<SharedView> = srcs.into_iter().map(|(v, _)| v).collect();
        let op = Box::new(Conv::new(
            name,
            views,
            dst.clone(),
            weight,
            bias,
            weight_view.clone(),
            bias_view.clone(),
            relu,
            work,
        ));
        self.push_producer(
            op,
            dst,
            &out_desc,
            vec![(weight_view, weight_off), (bias_view, bias_off)],
        )
    }

    /// Add a 2x2 max-pooling operator. The source tile must have even extent.
    pub fn add_pool(&mut self, name: impl Into<String>, src: OpId) -> TileResult<OpId> {
        let name = name.into();
        let (view, desc) = self.source(src)?;
        if desc.height() % 2 != 0 || desc.width() % 2 != 0 {
            return Err(unsupported_error!(
                "'{}' cannot pool an odd tile shape {}x{}",
                name,
                desc.height(),
                desc.width()
            ));
        }
        let out_desc = TensorDesc::chw(desc.channels(), desc.height() / 2, desc.width() / 2);
        let dst = shared_view(TensorView::unbacked(out_desc.clone()));
        let work = out_desc.element_count() as f64;
        let op = Box::new(Pool::new(name, view, dst.clone(), work));
        self.push_producer(op, dst, &out_desc, Vec::new())
    }

    /// Add a 2x nearest-neighbor upsampling operator.
    pub fn add_upsample(&mut self, name: impl Into<String>, src: OpId) -> TileResult<OpId> {
        let (view, desc) = self.source(src)?;
        let out_desc = TensorDesc::chw(desc.channels(), desc.height() * 2, desc.width() * 2);
        let dst = shared_view(TensorView::unbacked(out_desc.clone()));
        let work = out_desc.element_count() as f64;
        let op = Box::new(Upsample::new(name.into(), view, dst.clone(), work));
        self.push_producer(op, dst, &out_desc, Vec::new())
    }

    // ---------------------------------------------------------------------
    // Finalize / run
    // ---------------------------------------------------------------------

    /// Supply an externally owned scratch buffer, shared across sequentially
    /// run graphs. Undersized buffers are grown via realloc during finalize.
    pub fn set_scratch(&mut self, buffer: Buffer) -> TileResult<()> {
        if !Arc::ptr_eq(buffer.engine(), &self.engine) {
            return Err(usage_error!(
                "scratch buffer must be allocated by the graph's engine"
            ));
        }
        self.scratch = Some(buffer);
        self.external_scratch = true;
        self.dirty = true;
        Ok(())
    }

    /// Plan scratch offsets, size the backing buffer, and replay deferred
    /// bindings. Idempotent while the graph is unchanged; allocation failure
    /// leaves the graph un-finalized with its previous buffer intact.
    pub fn finalize(&mut self) -> TileResult<()> {
        if self.finalized && !self.dirty {
            return Ok(());
        }

        let plan = self.plan_scratch()?;
        let scratch_bytes = plan.total_byte_size();
        let total_bytes = scratch_bytes + self.private_byte_size;

        if let Some(buffer) = &self.scratch {
            if buffer.byte_size() < total_bytes {
                tracing::warn!(
                    have = buffer.byte_size(),
                    need = total_bytes,
                    "scratch buffer undersized, growing"
                );
                buffer.realloc(total_bytes)?;
            }
        } else {
            self.scratch = Some(Buffer::new(
                self.engine.clone(),
                total_bytes,
                Storage::Managed,
            )?);
        }
        let scratch = self
            .scratch
            .clone()
            .ok_or_else(|| TileForgeError::Internal("scratch buffer missing".into()))?;

        // Replay deferred bindings in registration order: attach concrete
        // addresses, then let each operator finish layout-dependent setup.
        for binding in &self.bindings {
            if let Some((view, alloc_id)) = &binding.scratch {
                let offset = plan.offset(*alloc_id).ok_or_else(|| {
                    TileForgeError::Internal(format!("allocation {} missing from plan", alloc_id))
                })?;
                lock_view(view)?.bind(&scratch, offset)?;
            }
            for (view, private_offset) in &binding.privates {
                lock_view(view)?.bind(&scratch, scratch_bytes + private_offset)?;
            }
        }
        let ops = &mut self.ops;
        for binding in &self.bindings {
            ops[binding.op_index].finalize_layout()?;
        }

        self.scratch_byte_size = scratch_bytes;
        self.finalized = true;
        self.dirty = false;
        tracing::debug!(
            ops = self.ops.len(),
            scratch_bytes,
            private_bytes = self.private_byte_size,
            "graph finalized"
        );
        Ok(())
    }

    /// Execute every operator in registration order, reporting normalized
    /// progress after each one. The progress callback may cancel; completed
    /// operators are not rolled back.
    pub fn run<P: Progress>(&mut self, progress: &mut P) -> TileResult<RunOutcome> {
        if !self.finalized || self.dirty {
            return Err(usage_error!(
                "run() requires a finalized graph; call finalize() first"
            ));
        }

        let total_work = self.work_amount();
        let mut done_work = 0.0;
        for (index, op) in self.ops.iter().enumerate() {
            op.execute()?;
            done_work += op.work_amount();
            let fraction = if total_work > 0.0 {
                done_work / total_work
            } else {
                1.0
            };
            if !progress.update(fraction) {
                tracing::debug!(completed_ops = index + 1, "run cancelled by progress sink");
                return Ok(RunOutcome::Cancelled {
                    completed_ops: index + 1,
                });
            }
        }
        self.engine.flush()?;
        Ok(RunOutcome::Completed)
    }

    /// Discard operators, planner state, and sizing, returning to the
    /// pre-build state. An externally owned scratch buffer is kept.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.records.clear();
        self.op_alloc.clear();
        self.bindings.clear();
        if !self.external_scratch {
            self.scratch = None;
        }
        self.scratch_byte_size = 0;
        self.private_byte_size = 0;
        self.next_alloc_id = 0;
        self.dirty = false;
        self.finalized = false;
    }
}
