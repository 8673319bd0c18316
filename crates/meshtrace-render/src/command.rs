//! One-shot command sequences.
//!
//! Every piece of device work is recorded into a fresh primary command
//! buffer, submitted, and waited on before the next sequence may begin.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use meshtrace_core::{SequenceId, SequenceTracker};

use crate::context::GpuContext;
use crate::error::{RenderError, RenderResult, VkResultExt};

/// Records and submits one-shot sequences on the context's queue.
pub struct CommandExecutor {
    ctx: Arc<GpuContext>,
    pool: vk::CommandPool,
    fence: vk::Fence,
    // Guards the pool, the queue and the tracker.
    state: Mutex<SequenceTracker>,
}

impl CommandExecutor {
    /// Creates the command pool and the completion fence.
    #[allow(unsafe_code)]
    pub fn new(ctx: Arc<GpuContext>) -> RenderResult<Self> {
        let device = ctx.device();
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(ctx.queue_family_index());
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .op("vkCreateCommandPool")?;
        let fence = match unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(f) => f,
            Err(result) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(RenderError::Vulkan {
                    op: "vkCreateFence",
                    result,
                });
            }
        };
        Ok(Self {
            ctx,
            pool,
            fence,
            state: Mutex::new(SequenceTracker::new()),
        })
    }

    /// The shared device context.
    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    fn lock(&self) -> MutexGuard<'_, SequenceTracker> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completion state of all sequences issued so far.
    ///
    /// The returned guard must be dropped before beginning or submitting a
    /// sequence.
    pub fn tracker(&self) -> MutexGuard<'_, SequenceTracker> {
        self.lock()
    }

    /// Whether `id` has executed.
    pub fn is_complete(&self, id: SequenceId) -> bool {
        self.lock().is_complete(id)
    }

    /// Starts recording a new sequence.
    ///
    /// Fails with `SequenceOutstanding` if a previous sequence has been
    /// neither submitted nor dropped.
    pub fn begin_one_shot(&self) -> RenderResult<OneShot<'_>> {
        let mut tracker = self.lock();
        let id = tracker.begin()?;
        match self.allocate_and_begin() {
            Ok(cmd) => {
                log::debug!("sequence {id}: recording");
                Ok(OneShot {
                    executor: self,
                    cmd,
                    id,
                    finished: false,
                })
            }
            Err(e) => {
                tracker.abandon(id)?;
                Err(e)
            }
        }
    }

    #[allow(unsafe_code)]
    fn allocate_and_begin(&self) -> RenderResult<vk::CommandBuffer> {
        let device = self.ctx.device();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.allocate_command_buffers(&alloc_info) }
            .op("vkAllocateCommandBuffers")?[0];
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(result) = unsafe { device.begin_command_buffer(cmd, &begin_info) } {
            unsafe { device.free_command_buffers(self.pool, &[cmd]) };
            return Err(RenderError::Vulkan {
                op: "vkBeginCommandBuffer",
                result,
            });
        }
        Ok(cmd)
    }

    /// Ends, submits and blocks until the queue has executed the sequence,
    /// then frees its command buffer.
    ///
    /// A sequence begun by another executor is rejected with
    /// [`RenderError::ForeignSequence`] and discarded by its own executor.
    #[allow(unsafe_code)]
    pub fn submit_and_wait(&self, mut seq: OneShot<'_>) -> RenderResult<SequenceId> {
        if !std::ptr::eq(seq.executor, self) {
            return Err(RenderError::ForeignSequence(seq.id));
        }
        seq.finished = true;
        let (cmd, id) = (seq.cmd, seq.id);
        drop(seq);

        let mut tracker = self.lock();
        let result = self.execute(cmd);
        let device = self.ctx.device();
        if result.is_err() {
            // The submission may still be pending; nothing else can be trusted.
            if let Err(e) = unsafe { device.device_wait_idle() } {
                log::warn!("vkDeviceWaitIdle after failed submission: {e}");
            }
        }
        unsafe { device.free_command_buffers(self.pool, &[cmd]) };

        match result {
            Ok(()) => {
                tracker.complete(id)?;
                log::debug!("sequence {id}: complete");
                Ok(id)
            }
            Err(e) => {
                tracker.abandon(id)?;
                Err(e)
            }
        }
    }

    #[allow(unsafe_code)]
    fn execute(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let device = self.ctx.device();
        unsafe {
            device.end_command_buffer(cmd).op("vkEndCommandBuffer")?;
            let cmds = [cmd];
            let submit = vk::SubmitInfo::default().command_buffers(&cmds);
            device
                .queue_submit(self.ctx.queue(), &[submit], self.fence)
                .op("vkQueueSubmit")?;
            device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .op("vkWaitForFences")?;
            device.reset_fences(&[self.fence]).op("vkResetFences")
        }
    }

    /// Frees an unsubmitted command buffer and retires its sequence.
    #[allow(unsafe_code)]
    fn discard(&self, cmd: vk::CommandBuffer, id: SequenceId) {
        let mut tracker = self.lock();
        unsafe { self.ctx.device().free_command_buffers(self.pool, &[cmd]) };
        if let Err(e) = tracker.abandon(id) {
            log::warn!("discarding sequence {id}: {e}");
        }
    }
}

impl Drop for CommandExecutor {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_fence(self.fence, None);
            self.ctx.device().destroy_command_pool(self.pool, None);
        }
    }
}

/// A sequence being recorded.
///
/// Submit it with [`CommandExecutor::submit_and_wait`]. Dropping it instead
/// discards everything recorded and frees the command buffer.
pub struct OneShot<'a> {
    executor: &'a CommandExecutor,
    cmd: vk::CommandBuffer,
    id: SequenceId,
    finished: bool,
}

impl OneShot<'_> {
    /// The sequence id; components tag pending work with it.
    pub fn id(&self) -> SequenceId {
        self.id
    }

    /// The command buffer in the recording state.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// The device the sequence records for.
    pub fn device(&self) -> &ash::Device {
        self.executor.ctx.device()
    }

    /// Records a global memory barrier.
    #[allow(unsafe_code)]
    pub fn memory_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);
        unsafe {
            self.device().cmd_pipeline_barrier(
                self.cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }
}

impl Drop for OneShot<'_> {
    fn drop(&mut self) {
        if !self.finished {
            log::warn!("sequence {} dropped without submission; discarding", self.id);
            self.executor.discard(self.cmd, self.id);
        }
    }
}
