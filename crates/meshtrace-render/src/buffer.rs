//! Buffer manager: allocation, staged uploads, host mapping and readback.

use std::sync::Arc;

use ash::vk;
use meshtrace_core::{
    BufferDesc, BufferId, BufferKind, BufferRecord, BufferUsage, HandleTable, HostAccess,
    MemoryVisibility, Residency, SequenceId, SequenceTracker, StagingLedger,
};

use crate::command::{CommandExecutor, OneShot};
use crate::context::GpuContext;
use crate::error::RenderResult;
use crate::memory::RawBuffer;

struct Allocation {
    raw: RawBuffer,
    record: BufferRecord,
}

/// Owns every device buffer of a render.
pub struct BufferManager {
    ctx: Arc<GpuContext>,
    buffers: HandleTable<BufferKind, Allocation>,
    staging: StagingLedger<RawBuffer>,
}

impl BufferManager {
    /// Creates an empty manager.
    pub fn new(ctx: Arc<GpuContext>) -> Self {
        Self {
            ctx,
            buffers: HandleTable::new(),
            staging: StagingLedger::new(),
        }
    }

    /// Allocates a buffer with a dedicated memory allocation.
    pub fn create_buffer(&mut self, desc: BufferDesc) -> RenderResult<BufferId> {
        desc.validate()?;
        let raw = RawBuffer::new(&self.ctx, desc.size, desc.usage, desc.visibility)?;
        log::debug!("buffer '{}': {} bytes, {:?}", desc.label, desc.size, desc.visibility);
        Ok(self.buffers.insert_with(|id| Allocation {
            raw,
            record: BufferRecord::new(id.index(), desc),
        }))
    }

    /// Creates a device-local buffer holding `data`.
    ///
    /// The copy is recorded into `seq` through a temporary staging buffer,
    /// which stays alive until [`BufferManager::finalize_and_release_staging`].
    #[allow(unsafe_code)]
    pub fn upload_initialized(
        &mut self,
        seq: &OneShot<'_>,
        label: &str,
        data: &[u8],
        usage: BufferUsage,
    ) -> RenderResult<BufferId> {
        self.staging.check_sequence(seq.id())?;
        let size = data.len() as u64;
        let desc = BufferDesc::new(
            label,
            size,
            usage | BufferUsage::TRANSFER_DST,
            MemoryVisibility::DeviceLocal,
        );
        desc.validate()?;

        let staging = RawBuffer::new(
            &self.ctx,
            size,
            BufferUsage::TRANSFER_SRC,
            MemoryVisibility::HostVisible,
        )?;
        if let Err(e) = staging.write(&self.ctx, data) {
            staging.destroy(&self.ctx);
            return Err(e);
        }
        let id = match self.create_buffer(desc) {
            Ok(id) => id,
            Err(e) => {
                staging.destroy(&self.ctx);
                return Err(e);
            }
        };

        let allocation = self.buffers.get_mut(id)?;
        let region = vk::BufferCopy::default().size(size);
        unsafe {
            seq.device().cmd_copy_buffer(
                seq.command_buffer(),
                staging.buffer,
                allocation.raw.buffer,
                &[region],
            );
        }
        allocation.record.begin_upload(seq.id())?;
        self.staging.hold(seq.id(), staging)?;
        log::debug!("buffer '{label}': {size} bytes staged in sequence {}", seq.id());
        Ok(id)
    }

    /// Frees all staging buffers. Their sequence must have executed.
    ///
    /// Returns the number of staging buffers released.
    pub fn finalize_and_release_staging(&mut self, executor: &CommandExecutor) -> RenderResult<usize> {
        let released = self.staging.release(&executor.tracker())?;
        let count = released.len();
        for raw in released {
            raw.destroy(&self.ctx);
        }
        if count > 0 {
            log::debug!("released {count} staging buffer(s)");
        }
        Ok(count)
    }

    /// Maps a host-visible buffer for the lifetime of the returned guard.
    ///
    /// Fails if a device write to the buffer has not been followed by a
    /// completed write-to-host barrier.
    pub fn map(&mut self, id: BufferId, executor: &CommandExecutor) -> RenderResult<MappedBuffer<'_>> {
        let ctx = &self.ctx;
        let allocation = self.buffers.get_mut(id)?;
        allocation.record.begin_map(&executor.tracker())?;
        let ptr = match allocation.raw.map(ctx) {
            Ok(ptr) => ptr,
            Err(e) => {
                allocation.record.end_map();
                return Err(e);
            }
        };
        #[allow(clippy::cast_possible_truncation)]
        let len = allocation.raw.size as usize;
        Ok(MappedBuffer {
            ctx,
            allocation,
            ptr,
            len,
        })
    }

    /// Copies a buffer's contents to the host through a temporary buffer.
    ///
    /// Works for device-local buffers; the buffer needs `TRANSFER_SRC` usage.
    #[allow(unsafe_code)]
    pub fn read_back(&mut self, id: BufferId, executor: &CommandExecutor) -> RenderResult<Vec<u8>> {
        let (src, size) = {
            let allocation = self.buffers.get_mut(id)?;
            allocation.record.require_usage(BufferUsage::TRANSFER_SRC)?;
            allocation.record.require_settled(&executor.tracker())?;
            (allocation.raw.buffer, allocation.raw.size)
        };

        let temp = RawBuffer::new(
            &self.ctx,
            size,
            BufferUsage::TRANSFER_DST,
            MemoryVisibility::HostVisible,
        )?;
        let result = copy_to_host(executor, src, &temp).and_then(|()| temp.read(&self.ctx));
        temp.destroy(&self.ctx);
        result
    }

    /// Destroys a buffer.
    ///
    /// Fails with `StaleHandle` if it was already destroyed and with `InUse`
    /// while a binding set references it.
    pub fn destroy(&mut self, id: BufferId) -> RenderResult<()> {
        let allocation = self.buffers.remove(id)?;
        log::debug!("buffer '{}' destroyed", allocation.record.desc().label);
        allocation.raw.destroy(&self.ctx);
        Ok(())
    }

    /// The buffer's requested description.
    pub fn desc(&self, id: BufferId) -> RenderResult<&BufferDesc> {
        Ok(self.buffers.get(id)?.record.desc())
    }

    /// Residency of the buffer's initial contents.
    pub fn residency(&mut self, id: BufferId, tracker: &SequenceTracker) -> RenderResult<Residency> {
        Ok(self.buffers.get_mut(id)?.record.residency(tracker))
    }

    /// Host-read ordering state.
    pub fn host_access(&self, id: BufferId) -> RenderResult<HostAccess> {
        Ok(self.buffers.get(id)?.record.host_access())
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffers are live.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub(crate) fn raw_buffer(&self, id: BufferId) -> RenderResult<vk::Buffer> {
        Ok(self.buffers.get(id)?.raw.buffer)
    }

    pub(crate) fn device_address(&self, id: BufferId) -> RenderResult<vk::DeviceAddress> {
        let allocation = self.buffers.get(id)?;
        allocation.record.require_usage(BufferUsage::DEVICE_ADDRESS)?;
        Ok(allocation.raw.device_address(&self.ctx))
    }

    /// Checks that a buffer can feed an acceleration-structure build.
    pub(crate) fn require_build_input(
        &mut self,
        id: BufferId,
        tracker: &SequenceTracker,
    ) -> RenderResult<()> {
        let record = &mut self.buffers.get_mut(id)?.record;
        record.require_usage(BufferUsage::BUILD_INPUT | BufferUsage::DEVICE_ADDRESS)?;
        record.require_resident(tracker)?;
        Ok(())
    }

    pub(crate) fn require_usage(&self, id: BufferId, usage: BufferUsage) -> RenderResult<()> {
        self.buffers.get(id)?.record.require_usage(usage)?;
        Ok(())
    }

    pub(crate) fn retain(&mut self, id: BufferId) -> RenderResult<()> {
        Ok(self.buffers.retain(id)?)
    }

    pub(crate) fn release(&mut self, id: BufferId) -> RenderResult<()> {
        Ok(self.buffers.release(id)?)
    }

    pub(crate) fn record_device_write(&mut self, id: BufferId, seq: SequenceId) -> RenderResult<()> {
        self.buffers.get_mut(id)?.record.record_device_write(seq);
        Ok(())
    }

    pub(crate) fn record_host_barrier(&mut self, id: BufferId, seq: SequenceId) -> RenderResult<()> {
        self.buffers.get_mut(id)?.record.record_host_barrier(seq)?;
        Ok(())
    }
}

#[allow(unsafe_code)]
fn copy_to_host(executor: &CommandExecutor, src: vk::Buffer, dst: &RawBuffer) -> RenderResult<()> {
    let seq = executor.begin_one_shot()?;
    let region = vk::BufferCopy::default().size(dst.size);
    unsafe {
        seq.device()
            .cmd_copy_buffer(seq.command_buffer(), src, dst.buffer, &[region]);
    }
    seq.memory_barrier(
        vk::PipelineStageFlags::TRANSFER,
        vk::AccessFlags::TRANSFER_WRITE,
        vk::PipelineStageFlags::HOST,
        vk::AccessFlags::HOST_READ,
    );
    executor.submit_and_wait(seq)?;
    Ok(())
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        let staging = self.staging.drain();
        let buffers = self.buffers.drain();
        if !buffers.is_empty() {
            log::warn!("releasing {} buffer(s) still alive at teardown", buffers.len());
        }
        for raw in staging {
            raw.destroy(&self.ctx);
        }
        for allocation in buffers {
            allocation.raw.destroy(&self.ctx);
        }
    }
}

/// Host mapping of one buffer; unmapped on drop.
pub struct MappedBuffer<'a> {
    ctx: &'a GpuContext,
    allocation: &'a mut Allocation,
    ptr: *mut u8,
    len: usize,
}

impl MappedBuffer<'_> {
    /// The mapped bytes.
    #[allow(unsafe_code)]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// The mapped bytes, writable.
    #[allow(unsafe_code)]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Copies the contents out as `T`s.
    pub fn to_vec<T: bytemuck::Pod>(&self) -> Vec<T> {
        bytemuck::pod_collect_to_vec(self.bytes())
    }

    /// Fills the buffer with repetitions of a 4-byte word.
    pub fn fill_words(&mut self, word: u32) {
        let bytes = word.to_ne_bytes();
        for chunk in self.bytes_mut().chunks_exact_mut(4) {
            chunk.copy_from_slice(&bytes);
        }
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedBuffer<'_> {
    fn drop(&mut self) {
        self.allocation.raw.unmap(self.ctx);
        self.allocation.record.end_map();
    }
}
