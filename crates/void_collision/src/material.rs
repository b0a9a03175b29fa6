//! Physical materials defining surface and mass properties

use serde::{Deserialize, Serialize};

/// Index of a material in a `MaterialLibrary`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct MaterialId(pub u32);

impl MaterialId {
    /// The engine default material, always present in a library
    pub const DEFAULT: Self = Self(0);
}

/// Physical material defining friction, restitution and density
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalMaterial {
    /// Name for diagnostics
    pub name: String,
    /// Friction coefficient (0 = frictionless, 1 = high friction)
    pub friction: f32,
    /// Restitution/bounciness (0 = no bounce, 1 = perfect bounce)
    pub restitution: f32,
    /// Density in g/cm³
    pub density: f32,
    /// Exponent applied to the computed mass; values below 1 flatten large masses
    pub raise_mass_to_power: f32,
    /// How friction is combined between two shapes
    pub friction_combine: CombineRule,
    /// How restitution is combined between two shapes
    pub restitution_combine: CombineRule,
}

impl Default for PhysicalMaterial {
    fn default() -> Self {
        Self {
            name: "Default".into(),
            friction: 0.7,
            restitution: 0.3,
            density: 1.0,
            raise_mass_to_power: 0.75,
            friction_combine: CombineRule::Average,
            restitution_combine: CombineRule::Average,
        }
    }
}

impl PhysicalMaterial {
    /// Create a new material
    pub fn new(name: impl Into<String>, friction: f32, restitution: f32) -> Self {
        Self {
            name: name.into(),
            friction,
            restitution,
            ..Default::default()
        }
    }

    /// Frictionless ice-like material
    pub fn ice() -> Self {
        Self {
            name: "Ice".into(),
            friction: 0.05,
            restitution: 0.0,
            density: 0.9,
            ..Default::default()
        }
    }

    /// Bouncy rubber-like material
    pub fn rubber() -> Self {
        Self {
            name: "Rubber".into(),
            friction: 0.8,
            restitution: 0.8,
            density: 1.1,
            ..Default::default()
        }
    }

    /// Metal material
    pub fn metal() -> Self {
        Self {
            name: "Metal".into(),
            friction: 0.3,
            restitution: 0.2,
            density: 7.8,
            ..Default::default()
        }
    }

    /// Set friction
    pub fn with_friction(mut self, friction: f32) -> Self {
        self.friction = friction.max(0.0);
        self
    }

    /// Set restitution
    pub fn with_restitution(mut self, restitution: f32) -> Self {
        self.restitution = restitution.clamp(0.0, 1.0);
        self
    }

    /// Set density in g/cm³
    pub fn with_density(mut self, density: f32) -> Self {
        self.density = density.max(0.0);
        self
    }

    /// Set the raise-mass-to-power exponent
    pub fn with_raise_mass_to_power(mut self, power: f32) -> Self {
        self.raise_mass_to_power = power;
        self
    }

    /// Combine two materials to get effective friction
    pub fn combine_friction(&self, other: &PhysicalMaterial) -> f32 {
        let rule = self.friction_combine.max_priority(other.friction_combine);
        rule.combine(self.friction, other.friction)
    }

    /// Combine two materials to get effective restitution
    pub fn combine_restitution(&self, other: &PhysicalMaterial) -> f32 {
        let rule = self.restitution_combine.max_priority(other.restitution_combine);
        rule.combine(self.restitution, other.restitution)
    }
}

/// Rule for combining material properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CombineRule {
    /// Use the average of both values
    #[default]
    Average,
    /// Use the minimum value
    Min,
    /// Use the maximum value
    Max,
    /// Multiply the values
    Multiply,
}

impl CombineRule {
    /// Get the higher priority rule
    pub fn max_priority(self, other: Self) -> Self {
        use CombineRule::*;
        match (self, other) {
            (Average, _) => other,
            (_, Average) => self,
            (Min, _) => Min,
            (_, Min) => Min,
            (Multiply, _) => Multiply,
            (_, Multiply) => Multiply,
            (Max, Max) => Max,
        }
    }

    /// Combine two values using this rule
    pub fn combine(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Average => (a + b) * 0.5,
            Self::Min => a.min(b),
            Self::Max => a.max(b),
            Self::Multiply => a * b,
        }
    }

    /// Backend equivalent
    pub fn to_rapier(self) -> rapier3d::prelude::CoefficientCombineRule {
        use rapier3d::prelude::CoefficientCombineRule as R;
        match self {
            Self::Average => R::Average,
            Self::Min => R::Min,
            Self::Max => R::Max,
            Self::Multiply => R::Multiply,
        }
    }
}

/// Registry of physical materials; slot 0 is the engine default
#[derive(Debug, Clone)]
pub struct MaterialLibrary {
    materials: Vec<PhysicalMaterial>,
}

impl Default for MaterialLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl MaterialLibrary {
    /// Library containing only the engine default material
    pub fn new() -> Self {
        Self {
            materials: vec![PhysicalMaterial::default()],
        }
    }

    /// Register a material and return its id
    pub fn add(&mut self, material: PhysicalMaterial) -> MaterialId {
        self.materials.push(material);
        MaterialId((self.materials.len() - 1) as u32)
    }

    /// Look up a material; unknown ids resolve to the engine default
    pub fn get(&self, id: MaterialId) -> &PhysicalMaterial {
        self.materials
            .get(id.0 as usize)
            .unwrap_or(&self.materials[0])
    }

    /// Replace the material stored under `id`; returns false for unknown ids
    pub fn set(&mut self, id: MaterialId, material: PhysicalMaterial) -> bool {
        match self.materials.get_mut(id.0 as usize) {
            Some(slot) => {
                *slot = material;
                true
            }
            None => false,
        }
    }

    /// Whether `id` names a registered material
    pub fn contains(&self, id: MaterialId) -> bool {
        (id.0 as usize) < self.materials.len()
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    /// Resolve the simple material: instance override, then component
    /// override, then the body template's material, then the first
    /// render-material-derived material, then the engine default.
    pub fn resolve_simple(
        &self,
        instance_override: Option<MaterialId>,
        component_override: Option<MaterialId>,
        template: Option<MaterialId>,
        render_derived: &[Option<MaterialId>],
    ) -> MaterialId {
        instance_override
            .or(component_override)
            .or(template)
            .or_else(|| render_derived.iter().flatten().next().copied())
            .filter(|id| self.contains(*id))
            .unwrap_or(MaterialId::DEFAULT)
    }

    /// Resolve one material per render slot for complex (triangle mesh) collision.
    /// An instance or component override applies to every slot.
    pub fn resolve_complex(
        &self,
        instance_override: Option<MaterialId>,
        component_override: Option<MaterialId>,
        render_derived: &[Option<MaterialId>],
    ) -> Vec<MaterialId> {
        if let Some(id) = instance_override.or(component_override) {
            return vec![id; render_derived.len().max(1)];
        }
        render_derived
            .iter()
            .map(|m| m.filter(|id| self.contains(*id)).unwrap_or(MaterialId::DEFAULT))
            .collect()
    }
}
