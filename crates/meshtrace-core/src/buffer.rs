//! Buffer descriptions and the residency / host-visibility state machines.
//!
//! The render crate owns the actual device memory; this module owns the
//! rules about when a buffer may be consumed by a build, bound, or read by
//! the host.

use bitflags::bitflags;

use crate::error::{CoreError, Result};
use crate::sequence::{SequenceId, SequenceTracker};

bitflags! {
    /// Capabilities a buffer is created with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Readable/writable from shaders as a storage buffer.
        const STORAGE = 1 << 0;
        /// Readable by acceleration-structure builds.
        const BUILD_INPUT = 1 << 1;
        /// Source of transfer commands.
        const TRANSFER_SRC = 1 << 2;
        /// Destination of transfer commands.
        const TRANSFER_DST = 1 << 3;
        /// Has a queryable device address.
        const DEVICE_ADDRESS = 1 << 4;
        /// Backing store of an acceleration structure.
        const ACCELERATION_STORAGE = 1 << 5;
    }
}

/// Which side of the bus can see a buffer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryVisibility {
    /// Device-local memory; the host cannot map it.
    DeviceLocal,
    /// Host-visible, coherent and (when available) cached memory.
    HostVisible,
}

/// What a buffer was requested as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    /// Debug label.
    pub label: String,
    /// Size in bytes.
    pub size: u64,
    /// Usage capabilities.
    pub usage: BufferUsage,
    /// Memory visibility class.
    pub visibility: MemoryVisibility,
}

impl BufferDesc {
    /// Creates a description.
    pub fn new(
        label: impl Into<String>,
        size: u64,
        usage: BufferUsage,
        visibility: MemoryVisibility,
    ) -> Self {
        Self {
            label: label.into(),
            size,
            usage,
            visibility,
        }
    }

    /// Rejects requests this pipeline never satisfies.
    ///
    /// Build inputs and structure storage are device-local only; host-visible
    /// memory is reserved for staging and readback.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(CoreError::UnsupportedCombination(format!(
                "'{}' has zero size",
                self.label
            )));
        }
        if self.usage.is_empty() {
            return Err(CoreError::UnsupportedCombination(format!(
                "'{}' has no usage",
                self.label
            )));
        }
        if self.visibility == MemoryVisibility::HostVisible
            && self
                .usage
                .intersects(BufferUsage::BUILD_INPUT | BufferUsage::ACCELERATION_STORAGE)
        {
            return Err(CoreError::UnsupportedCombination(format!(
                "'{}' requests {:?} on host-visible memory",
                self.label, self.usage
            )));
        }
        Ok(())
    }
}

/// Whether a buffer's initial contents have reached the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Created without initial data.
    Allocated,
    /// A staged copy is recorded in this sequence.
    Uploading(SequenceId),
    /// Initial data is on the device.
    Resident,
}

impl Residency {
    fn name(self) -> &'static str {
        match self {
            Residency::Allocated => "allocated",
            Residency::Uploading(_) => "uploading",
            Residency::Resident => "resident",
        }
    }
}

/// Host-read ordering state of a host-visible buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAccess {
    /// No device write has been recorded.
    Idle,
    /// A device write is recorded in this sequence, with no barrier yet.
    DeviceWritePending(SequenceId),
    /// A write-to-host barrier follows the write in this sequence.
    BarrierRecorded(SequenceId),
    /// The write and its barrier have executed; the host may read.
    Readable,
}

impl HostAccess {
    fn name(self) -> &'static str {
        match self {
            HostAccess::Idle => "idle",
            HostAccess::DeviceWritePending(_) => "awaiting a write-to-host barrier",
            HostAccess::BarrierRecorded(_) => "awaiting completion of its barrier",
            HostAccess::Readable => "readable",
        }
    }
}

/// Bookkeeping for one buffer.
#[derive(Debug, Clone)]
pub struct BufferRecord {
    index: u32,
    desc: BufferDesc,
    residency: Residency,
    host_access: HostAccess,
    mapped: bool,
}

impl BufferRecord {
    /// Starts tracking a freshly allocated buffer.
    pub fn new(index: u32, desc: BufferDesc) -> Self {
        Self {
            index,
            desc,
            residency: Residency::Allocated,
            host_access: HostAccess::Idle,
            mapped: false,
        }
    }

    /// The requested description.
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// Current residency, promoting completed uploads.
    pub fn residency(&mut self, tracker: &SequenceTracker) -> Residency {
        if let Residency::Uploading(seq) = self.residency {
            if tracker.is_complete(seq) {
                self.residency = Residency::Resident;
            }
        }
        self.residency
    }

    /// Current host access state.
    pub fn host_access(&self) -> HostAccess {
        self.host_access
    }

    /// Fails unless the buffer carries every capability in `required`.
    pub fn require_usage(&self, required: BufferUsage) -> Result<()> {
        let missing = required - self.desc.usage;
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::MissingUsage {
                index: self.index,
                missing: format!("{missing:?}"),
            })
        }
    }

    /// Records that a staged copy into this buffer is part of `seq`.
    pub fn begin_upload(&mut self, seq: SequenceId) -> Result<()> {
        if self.residency != Residency::Allocated {
            return Err(CoreError::BufferNotReady {
                index: self.index,
                state: self.residency.name(),
                expected: "allocated",
            });
        }
        self.residency = Residency::Uploading(seq);
        Ok(())
    }

    /// Fails unless the initial data is on the device.
    pub fn require_resident(&mut self, tracker: &SequenceTracker) -> Result<()> {
        match self.residency(tracker) {
            Residency::Resident => Ok(()),
            other => Err(CoreError::BufferNotReady {
                index: self.index,
                state: other.name(),
                expected: "resident",
            }),
        }
    }

    /// Fails while a staged upload into the buffer has not executed.
    pub fn require_settled(&mut self, tracker: &SequenceTracker) -> Result<()> {
        match self.residency(tracker) {
            Residency::Uploading(_) => Err(CoreError::BufferNotReady {
                index: self.index,
                state: "uploading",
                expected: "allocated or resident",
            }),
            _ => Ok(()),
        }
    }

    /// Records a device write in `seq`. Only tracked for host-visible buffers.
    pub fn record_device_write(&mut self, seq: SequenceId) {
        if self.desc.visibility == MemoryVisibility::HostVisible {
            self.host_access = HostAccess::DeviceWritePending(seq);
        }
    }

    /// Records the write-to-host barrier that follows the write in `seq`.
    pub fn record_host_barrier(&mut self, seq: SequenceId) -> Result<()> {
        self.require_host_visible()?;
        match self.host_access {
            HostAccess::DeviceWritePending(s) if s == seq => {
                self.host_access = HostAccess::BarrierRecorded(seq);
                Ok(())
            }
            _ => Err(CoreError::NoPendingWrite {
                index: self.index,
                sequence: seq.0,
            }),
        }
    }

    /// Fails unless the host may read the buffer now.
    pub fn require_host_readable(&mut self, tracker: &SequenceTracker) -> Result<()> {
        self.require_host_visible()?;
        if let HostAccess::BarrierRecorded(seq) = self.host_access {
            if tracker.is_complete(seq) {
                self.host_access = HostAccess::Readable;
            }
        }
        match self.host_access {
            HostAccess::Idle | HostAccess::Readable => Ok(()),
            other => Err(CoreError::ReadBeforeBarrier {
                index: self.index,
                state: other.name(),
            }),
        }
    }

    /// Fails unless the buffer lives in host-visible memory.
    pub fn require_host_visible(&self) -> Result<()> {
        if self.desc.visibility == MemoryVisibility::HostVisible {
            Ok(())
        } else {
            Err(CoreError::NotHostVisible(self.index))
        }
    }

    /// Marks the buffer mapped; fails on nested maps.
    pub fn begin_map(&mut self, tracker: &SequenceTracker) -> Result<()> {
        self.require_host_readable(tracker)?;
        if self.mapped {
            return Err(CoreError::AlreadyMapped(self.index));
        }
        self.mapped = true;
        Ok(())
    }

    /// Marks the buffer unmapped.
    pub fn end_map(&mut self) {
        self.mapped = false;
    }

    /// Whether a host mapping is live.
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }
}

/// Temporary staging allocations held until their copies have executed.
///
/// All held items belong to a single sequence. Uploading in a later sequence
/// requires the earlier staging to be released first.
#[derive(Debug)]
pub struct StagingLedger<T> {
    held: Option<SequenceId>,
    items: Vec<T>,
}

impl<T> Default for StagingLedger<T> {
    fn default() -> Self {
        Self {
            held: None,
            items: Vec::new(),
        }
    }
}

impl<T> StagingLedger<T> {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if staging from another sequence is still held.
    pub fn check_sequence(&self, seq: SequenceId) -> Result<()> {
        match self.held {
            Some(held) if held != seq => Err(CoreError::StagingNotReleased {
                held: held.0,
                requested: seq.0,
            }),
            _ => Ok(()),
        }
    }

    /// Holds a staging item until `seq` has executed.
    pub fn hold(&mut self, seq: SequenceId, item: T) -> Result<()> {
        self.check_sequence(seq)?;
        self.held = Some(seq);
        self.items.push(item);
        Ok(())
    }

    /// Hands back every held item once its sequence has left the queue.
    pub fn release(&mut self, tracker: &SequenceTracker) -> Result<Vec<T>> {
        if let Some(held) = self.held {
            if !tracker.is_settled(held) {
                return Err(CoreError::StagingInFlight(held.0));
            }
        }
        self.held = None;
        Ok(std::mem::take(&mut self.items))
    }

    /// Hands back every held item regardless of sequence state.
    ///
    /// Only valid once the device is idle.
    pub fn drain(&mut self) -> Vec<T> {
        self.held = None;
        std::mem::take(&mut self.items)
    }

    /// Number of held items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
