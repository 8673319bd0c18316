//! Declarative binding layouts and binding-set validation.

use bitflags::bitflags;

use crate::error::{CoreError, Result};
use crate::handle::{BufferId, TlasId};

/// What a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    StorageBuffer,
    AccelerationStructure,
}

impl ResourceKind {
    /// Short name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::StorageBuffer => "storage buffer",
            ResourceKind::AccelerationStructure => "acceleration structure",
        }
    }
}

bitflags! {
    /// Shader stages that may access a slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const COMPUTE = 1 << 0;
    }
}

/// One declared slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDecl {
    pub slot: u32,
    pub kind: ResourceKind,
    pub stages: ShaderStages,
}

impl SlotDecl {
    /// A compute-stage slot.
    pub fn compute(slot: u32, kind: ResourceKind) -> Self {
        Self {
            slot,
            kind,
            stages: ShaderStages::COMPUTE,
        }
    }
}

/// Output image slot of the ray tracing program.
pub const OUTPUT_SLOT: u32 = 0;
/// Top-level acceleration structure slot.
pub const TLAS_SLOT: u32 = 1;
/// Vertex position slot.
pub const VERTEX_SLOT: u32 = 2;
/// Triangle index slot.
pub const INDEX_SLOT: u32 = 3;

/// A validated, ordered list of slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutDecl {
    slots: Vec<SlotDecl>,
}

impl LayoutDecl {
    /// Validates a slot list: non-empty, strictly increasing slot numbers,
    /// at least one stage per slot.
    pub fn new(slots: Vec<SlotDecl>) -> Result<Self> {
        if slots.is_empty() {
            return Err(CoreError::InvalidLayout("no slots declared".into()));
        }
        for pair in slots.windows(2) {
            if pair[1].slot <= pair[0].slot {
                return Err(CoreError::InvalidLayout(format!(
                    "slot {} follows slot {}; slots must be strictly increasing",
                    pair[1].slot, pair[0].slot
                )));
            }
        }
        if let Some(decl) = slots.iter().find(|d| d.stages.is_empty()) {
            return Err(CoreError::InvalidLayout(format!(
                "slot {} has no shader stages",
                decl.slot
            )));
        }
        Ok(Self { slots })
    }

    /// The four-slot layout the ray tracing program is written against.
    pub fn ray_tracing() -> Self {
        Self {
            slots: vec![
                SlotDecl::compute(OUTPUT_SLOT, ResourceKind::StorageBuffer),
                SlotDecl::compute(TLAS_SLOT, ResourceKind::AccelerationStructure),
                SlotDecl::compute(VERTEX_SLOT, ResourceKind::StorageBuffer),
                SlotDecl::compute(INDEX_SLOT, ResourceKind::StorageBuffer),
            ],
        }
    }

    /// Declared slots in order.
    pub fn slots(&self) -> &[SlotDecl] {
        &self.slots
    }

    /// Looks up a slot declaration.
    pub fn slot(&self, slot: u32) -> Option<&SlotDecl> {
        self.slots.iter().find(|d| d.slot == slot)
    }

    /// How many slots of `kind` the layout declares.
    pub fn count_of(&self, kind: ResourceKind) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let count = self.slots.iter().filter(|d| d.kind == kind).count() as u32;
        count
    }
}

/// A resource attached to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundResource {
    Buffer(BufferId),
    Tlas(TlasId),
}

impl BoundResource {
    /// The slot kind this resource satisfies.
    pub fn kind(self) -> ResourceKind {
        match self {
            BoundResource::Buffer(_) => ResourceKind::StorageBuffer,
            BoundResource::Tlas(_) => ResourceKind::AccelerationStructure,
        }
    }
}

/// Slot contents of one binding set.
///
/// A set is mutable until its first use by a dispatch; after that it is
/// frozen.
#[derive(Debug, Clone)]
pub struct BindingSetState {
    layout: LayoutDecl,
    bound: Vec<Option<BoundResource>>,
    used: bool,
}

impl BindingSetState {
    /// An empty set for `layout`.
    pub fn new(layout: LayoutDecl) -> Self {
        let bound = vec![None; layout.slots.len()];
        Self {
            layout,
            bound,
            used: false,
        }
    }

    /// The layout this set follows.
    pub fn layout(&self) -> &LayoutDecl {
        &self.layout
    }

    /// Attaches `resource` to `slot`, returning the resource it replaced.
    pub fn bind(&mut self, slot: u32, resource: BoundResource) -> Result<Option<BoundResource>> {
        let position = self
            .layout
            .slots
            .iter()
            .position(|d| d.slot == slot)
            .ok_or(CoreError::UnknownSlot(slot))?;
        let expected = self.layout.slots[position].kind;
        if resource.kind() != expected {
            return Err(CoreError::SlotKindMismatch {
                slot,
                expected: expected.name(),
                actual: resource.kind().name(),
            });
        }
        if self.used {
            return Err(CoreError::RebindAfterUse(slot));
        }
        Ok(self.bound[position].replace(resource))
    }

    /// Fails on the first declared slot with nothing bound.
    pub fn ensure_complete(&self) -> Result<()> {
        match self.bound.iter().position(Option::is_none) {
            Some(position) => Err(CoreError::SlotUnbound(self.layout.slots[position].slot)),
            None => Ok(()),
        }
    }

    /// Freezes the set. Called when a dispatch first records it.
    pub fn mark_used(&mut self) {
        self.used = true;
    }

    /// Whether a dispatch has recorded this set.
    pub fn is_used(&self) -> bool {
        self.used
    }

    /// The resource on `slot`, if bound.
    pub fn resource(&self, slot: u32) -> Option<BoundResource> {
        self.layout
            .slots
            .iter()
            .position(|d| d.slot == slot)
            .and_then(|p| self.bound[p])
    }

    /// Bound buffers in slot order.
    pub fn buffers(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.bound.iter().filter_map(|b| match b {
            Some(BoundResource::Buffer(id)) => Some(*id),
            _ => None,
        })
    }

    /// Bound top-level structures in slot order.
    pub fn tlases(&self) -> impl Iterator<Item = TlasId> + '_ {
        self.bound.iter().filter_map(|b| match b {
            Some(BoundResource::Tlas(id)) => Some(*id),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{BufferKind, HandleTable, TlasKind};

    #[test]
    fn test_ray_tracing_layout_is_valid() {
        let layout = LayoutDecl::ray_tracing();
        assert_eq!(LayoutDecl::new(layout.slots().to_vec()).unwrap(), layout);
        assert_eq!(layout.count_of(ResourceKind::StorageBuffer), 3);
        assert_eq!(layout.count_of(ResourceKind::AccelerationStructure), 1);
        assert_eq!(
            layout.slot(TLAS_SLOT).map(|d| d.kind),
            Some(ResourceKind::AccelerationStructure)
        );
    }

    #[test]
    fn test_layout_rejects_bad_declarations() {
        assert!(LayoutDecl::new(vec![]).is_err());

        let duplicate = vec![
            SlotDecl::compute(0, ResourceKind::StorageBuffer),
            SlotDecl::compute(0, ResourceKind::StorageBuffer),
        ];
        assert!(matches!(
            LayoutDecl::new(duplicate),
            Err(CoreError::InvalidLayout(_))
        ));

        let unordered = vec![
            SlotDecl::compute(2, ResourceKind::StorageBuffer),
            SlotDecl::compute(1, ResourceKind::StorageBuffer),
        ];
        assert!(LayoutDecl::new(unordered).is_err());

        let stageless = vec![SlotDecl {
            slot: 0,
            kind: ResourceKind::StorageBuffer,
            stages: ShaderStages::empty(),
        }];
        assert!(LayoutDecl::new(stageless).is_err());
    }

    #[test]
    fn test_bind_validation() {
        let mut buffers: HandleTable<BufferKind, ()> = HandleTable::new();
        let mut tlases: HandleTable<TlasKind, ()> = HandleTable::new();
        let output = buffers.insert(());
        let tlas = tlases.insert(());

        let mut set = BindingSetState::new(LayoutDecl::ray_tracing());
        assert!(matches!(
            set.bind(7, BoundResource::Buffer(output)),
            Err(CoreError::UnknownSlot(7))
        ));
        assert!(matches!(
            set.bind(TLAS_SLOT, BoundResource::Buffer(output)),
            Err(CoreError::SlotKindMismatch { slot: 1, .. })
        ));

        set.bind(OUTPUT_SLOT, BoundResource::Buffer(output)).unwrap();
        set.bind(TLAS_SLOT, BoundResource::Tlas(tlas)).unwrap();
        assert!(matches!(
            set.ensure_complete(),
            Err(CoreError::SlotUnbound(VERTEX_SLOT))
        ));
        set.bind(VERTEX_SLOT, BoundResource::Buffer(output)).unwrap();
        set.bind(INDEX_SLOT, BoundResource::Buffer(output)).unwrap();
        set.ensure_complete().unwrap();

        assert_eq!(set.buffers().count(), 3);
        assert_eq!(set.tlases().collect::<Vec<_>>(), vec![tlas]);
        assert_eq!(set.resource(TLAS_SLOT), Some(BoundResource::Tlas(tlas)));
    }

    #[test]
    fn test_rebind_after_use() {
        let mut buffers: HandleTable<BufferKind, ()> = HandleTable::new();
        let a = buffers.insert(());
        let b = buffers.insert(());
        let layout =
            LayoutDecl::new(vec![SlotDecl::compute(0, ResourceKind::StorageBuffer)]).unwrap();
        let mut set = BindingSetState::new(layout);

        assert_eq!(set.bind(0, BoundResource::Buffer(a)).unwrap(), None);
        assert_eq!(
            set.bind(0, BoundResource::Buffer(b)).unwrap(),
            Some(BoundResource::Buffer(a))
        );
        set.mark_used();
        assert!(matches!(
            set.bind(0, BoundResource::Buffer(a)),
            Err(CoreError::RebindAfterUse(0))
        ));
    }
}
