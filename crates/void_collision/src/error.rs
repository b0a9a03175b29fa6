//! Error types for the collision system

use crate::identity::BodyId;
use thiserror::Error;

/// Collision system errors
#[derive(Debug, Error)]
pub enum CollisionError {
    /// Body id is not registered with the scene
    #[error("Body not found: {0:?}")]
    BodyNotFound(BodyId),

    /// Body exists but has no backend representation yet
    #[error("Body has not been initialized: {0:?}")]
    BodyNotInitialized(BodyId),

    /// Transform contains NaN or cannot be represented by the body template
    #[error("Invalid transform: {0}")]
    InvalidTransform(String),

    /// Scale is nearly zero or otherwise unusable
    #[error("Invalid scale: {0}")]
    InvalidScale(String),

    /// Shape creation failed
    #[error("Failed to create collision shape: {0}")]
    ShapeCreationFailed(String),

    /// Body has no template to build shapes from
    #[error("Body has no body setup: {0:?}")]
    NoTemplate(BodyId),

    /// Scene index out of range
    #[error("Scene not found: {0}")]
    SceneNotFound(usize),

    /// Invalid configuration
    #[error("Invalid collision configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for collision operations
pub type Result<T> = std::result::Result<T, CollisionError>;
