//! Engine-side math: transforms with non-uniform scale and tolerance constants
//!
//! Everything is expressed with the backend's nalgebra types so no
//! conversion is needed at the backend boundary. The engine convention is
//! Z up, centimetres.

use rapier3d::na::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Tolerance for "effectively zero" lengths and distances
pub const KINDA_SMALL_NUMBER: f32 = 1.0e-4;

/// Tolerance for divisions and normalisation
pub const SMALL_NUMBER: f32 = 1.0e-8;

/// Large sentinel distance
pub const BIG_NUMBER: f32 = 3.4e38;

/// Engine vector type
pub type Vec3 = Vector3<f32>;

/// Engine rotation type
pub type Quat = UnitQuaternion<f32>;

/// Complete 3D transform with translation, rotation and non-uniform scale
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    /// Identity transform
    pub fn identity() -> Self {
        Self {
            translation: Vec3::zeros(),
            rotation: Quat::identity(),
            scale: Vec3::repeat(1.0),
        }
    }

    /// Create a new transform
    #[inline]
    pub fn new(translation: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            translation,
            rotation,
            scale,
        }
    }

    /// Create from translation only
    #[inline]
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Self::identity()
        }
    }

    /// Create from translation and rotation
    #[inline]
    pub fn from_translation_rotation(translation: Vec3, rotation: Quat) -> Self {
        Self {
            translation,
            rotation,
            scale: Vec3::repeat(1.0),
        }
    }

    /// Set scale (builder pattern)
    #[inline]
    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// Set rotation (builder pattern)
    #[inline]
    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Rigid part of the transform, as used by the backend
    #[inline]
    pub fn to_isometry(&self) -> Isometry3<f32> {
        Isometry3::from_parts(Translation3::from(self.translation), self.rotation)
    }

    /// Build from a backend pose and a scale
    #[inline]
    pub fn from_isometry(pose: &Isometry3<f32>, scale: Vec3) -> Self {
        Self {
            translation: pose.translation.vector,
            rotation: pose.rotation,
            scale,
        }
    }

    /// Transform a point (scale, rotate, translate)
    #[inline]
    pub fn transform_point(&self, point: &Vec3) -> Vec3 {
        self.translation + self.rotation * point.component_mul(&self.scale)
    }

    /// Transform a direction (ignores translation and scale)
    #[inline]
    pub fn transform_vector_no_scale(&self, v: &Vec3) -> Vec3 {
        self.rotation * v
    }

    /// Inverse-transform a point into local space, ignoring scale
    #[inline]
    pub fn inverse_transform_point_no_scale(&self, point: &Vec3) -> Vec3 {
        self.rotation.inverse() * (point - self.translation)
    }

    /// Determinant of the scale part; negative means mirrored
    #[inline]
    pub fn determinant(&self) -> f32 {
        self.scale.x * self.scale.y * self.scale.z
    }

    /// True if any component is NaN or infinite
    pub fn contains_nan(&self) -> bool {
        !(self.translation.iter().all(|v| v.is_finite())
            && self.rotation.coords.iter().all(|v| v.is_finite())
            && self.scale.iter().all(|v| v.is_finite()))
    }

    /// True if every scale component is within `tolerance` of zero
    pub fn scale_is_nearly_zero(&self, tolerance: f32) -> bool {
        self.scale.iter().all(|s| s.abs() <= tolerance)
    }

    /// `other` expressed relative to `self` (rigid part only, scale carried from `other`)
    pub fn relative_to(&self, other: &Transform) -> Transform {
        let inv = self.rotation.inverse();
        Transform {
            translation: inv * (other.translation - self.translation),
            rotation: inv * other.rotation,
            scale: other.scale,
        }
    }

    /// Compose a local transform onto this one (rigid part only)
    pub fn compose_rigid(&self, local: &Transform) -> Transform {
        Transform {
            translation: self.translation + self.rotation * local.translation,
            rotation: self.rotation * local.rotation,
            scale: local.scale,
        }
    }
}

/// True if every component of `v` is within `tolerance` of zero
#[inline]
pub fn is_nearly_zero(v: &Vec3, tolerance: f32) -> bool {
    v.iter().all(|c| c.abs() <= tolerance)
}

/// True if all three components are equal within `tolerance`
#[inline]
pub fn is_uniform(v: &Vec3, tolerance: f32) -> bool {
    (v.x - v.y).abs() <= tolerance && (v.y - v.z).abs() <= tolerance
}

/// True if the vector has no NaN or infinite components
#[inline]
pub fn is_finite(v: &Vec3) -> bool {
    v.iter().all(|c| c.is_finite())
}

/// Normalize or return `None` when the length is below SMALL_NUMBER
#[inline]
pub fn safe_normal(v: &Vec3) -> Option<Vec3> {
    v.try_normalize(SMALL_NUMBER)
}

/// Convert a vector into a backend point
#[inline]
pub fn to_point(v: &Vec3) -> Point3<f32> {
    Point3::from(*v)
}
