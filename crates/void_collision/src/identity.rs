//! Engine identities and the shape identity side table
//!
//! Backend shapes never carry engine pointers. Every shape created by a body
//! is registered here under its backend handle and removed again when the
//! shape is destroyed, so converters can resolve a raw hit to the owning
//! actor/component/body in O(1).

use crate::material::MaterialId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque identity of an engine actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ActorId(pub u64);

/// Opaque identity of an engine component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ComponentId(pub u64);

/// Identity of a body instance registered with a `PhysScene`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyId(pub u64);

impl BodyId {
    /// Create from raw id
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get raw id
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Backend shape handle, unique within one scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(pub u64);

/// Everything an engine hit needs to know about the shape it came from
#[derive(Debug, Clone, Default)]
pub struct ShapeIdentity {
    pub actor: ActorId,
    pub component: ComponentId,
    /// Body that created the shape; for welded shapes, the child body
    pub body: Option<BodyId>,
    /// Item index reported in overlaps; `None` unless the owner opted into multi-body overlap
    pub item: Option<i32>,
    pub bone: Option<Arc<str>>,
    /// Simple material, or one entry per material slot for complex shapes
    pub materials: Vec<MaterialId>,
    /// Per-triangle slot index for triangle meshes
    pub face_materials: Option<Arc<[u16]>>,
}

impl ShapeIdentity {
    /// Material of the shape, resolved per triangle when a face index is known
    pub fn material_for_face(&self, face_index: Option<u32>) -> Option<MaterialId> {
        if let (Some(face), Some(slots)) = (face_index, self.face_materials.as_ref()) {
            if let Some(slot) = slots.get(face as usize) {
                if let Some(material) = self.materials.get(*slot as usize) {
                    return Some(*material);
                }
            }
        }
        self.materials.first().copied()
    }
}

/// Side table from backend shape handle to engine identity
#[derive(Debug, Default)]
pub struct ShapeIdentityTable {
    entries: HashMap<ShapeId, ShapeIdentity>,
}

impl ShapeIdentityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shape; replaces any stale entry under the same handle
    pub fn insert(&mut self, shape: ShapeId, identity: ShapeIdentity) {
        self.entries.insert(shape, identity);
    }

    pub fn remove(&mut self, shape: ShapeId) -> Option<ShapeIdentity> {
        self.entries.remove(&shape)
    }

    pub fn get(&self, shape: ShapeId) -> Option<&ShapeIdentity> {
        self.entries.get(&shape)
    }

    pub fn get_mut(&mut self, shape: ShapeId) -> Option<&mut ShapeIdentity> {
        self.entries.get_mut(&shape)
    }

    /// Drop every entry created by `body`
    pub fn remove_body(&mut self, body: BodyId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, id| id.body != Some(body));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
