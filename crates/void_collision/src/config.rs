//! Collision configuration

use crate::error::{CollisionError, Result};
use serde::{Deserialize, Serialize};

/// Collision subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollisionConfig {
    /// Capacity of the raycast/sweep hit buffer per scene
    pub hit_buffer_size: usize,

    /// Capacity of the overlap buffer per scene
    pub overlap_buffer_size: usize,

    /// Number of requests handed to one background task by the async trace manager
    pub async_trace_chunk_size: usize,

    /// First inflation tried when recovering a penetration normal
    pub small_mtd_inflation: f32,

    /// Second inflation tried when recovering a penetration normal
    pub large_mtd_inflation: f32,

    /// Maximum number of triangles gathered when recovering a mesh normal
    pub max_overlapped_triangles: usize,

    /// Scale components below this magnitude are nudged away from zero
    pub scale_small_threshold: f32,

    /// Gravity vector in engine units (cm/s², Z up)
    pub gravity: [f32; 3],

    /// Fixed timestep for scene stepping
    pub timestep: f32,

    /// Largest delta time a single step may simulate
    pub max_physics_delta_time: f32,

    /// Create a second ("async") scene for bodies that prefer it
    pub enable_async_scene: bool,

    /// Editor-only: force query-only collision so traces see everything
    pub editor_trace_collision: bool,

    /// Scene belongs to a running game world (enables auto-weld)
    pub game_world: bool,

    /// Minimum density in kg/m³ used for mass computation
    pub min_density: f32,

    /// Default linear sleep threshold
    pub sleep_linear_threshold: f32,

    /// Default angular sleep threshold
    pub sleep_angular_threshold: f32,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            hit_buffer_size: 512,
            overlap_buffer_size: 4096,
            async_trace_chunk_size: 64,
            small_mtd_inflation: 0.25,
            large_mtd_inflation: 1.75,
            max_overlapped_triangles: 64,
            scale_small_threshold: 0.1,
            gravity: [0.0, 0.0, -980.0],
            timestep: 1.0 / 60.0,
            max_physics_delta_time: 1.0 / 30.0,
            enable_async_scene: false,
            editor_trace_collision: false,
            game_world: true,
            min_density: 0.09,
            sleep_linear_threshold: 0.4,
            sleep_angular_threshold: 0.1,
        }
    }
}

impl CollisionConfig {
    /// Configuration with a second ("async") scene
    pub fn with_async_scene() -> Self {
        Self {
            enable_async_scene: true,
            ..Default::default()
        }
    }

    /// Configuration for an editor world: no auto-weld, trace collision forced on
    pub fn editor() -> Self {
        Self {
            game_world: false,
            editor_trace_collision: true,
            ..Default::default()
        }
    }

    /// Set gravity
    pub fn with_gravity(mut self, x: f32, y: f32, z: f32) -> Self {
        self.gravity = [x, y, z];
        self
    }

    /// Set timestep
    pub fn with_timestep(mut self, timestep: f32) -> Self {
        self.timestep = timestep;
        self
    }

    /// Set hit and overlap buffer capacities
    pub fn with_buffer_sizes(mut self, hits: usize, overlaps: usize) -> Self {
        self.hit_buffer_size = hits;
        self.overlap_buffer_size = overlaps;
        self
    }

    /// Set the async trace chunk size
    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        self.async_trace_chunk_size = chunk;
        self
    }

    /// Number of logical scenes this configuration creates
    pub fn scene_count(&self) -> usize {
        if self.enable_async_scene {
            2
        } else {
            1
        }
    }

    /// Check the configuration for values the subsystem cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.hit_buffer_size == 0 || self.overlap_buffer_size == 0 {
            return Err(CollisionError::InvalidConfig(
                "buffer sizes must be non-zero".into(),
            ));
        }
        if self.async_trace_chunk_size == 0 {
            return Err(CollisionError::InvalidConfig(
                "async trace chunk size must be non-zero".into(),
            ));
        }
        if !(self.timestep > 0.0) || !(self.max_physics_delta_time > 0.0) {
            return Err(CollisionError::InvalidConfig(format!(
                "timestep {} and max delta {} must be positive",
                self.timestep, self.max_physics_delta_time
            )));
        }
        if self.small_mtd_inflation < 0.0 || self.large_mtd_inflation < self.small_mtd_inflation {
            return Err(CollisionError::InvalidConfig(
                "mtd inflations must be non-negative and increasing".into(),
            ));
        }
        if !(self.scale_small_threshold > 0.0) {
            return Err(CollisionError::InvalidConfig(
                "scale threshold must be positive".into(),
            ));
        }
        if self.gravity.iter().any(|g| !g.is_finite()) {
            return Err(CollisionError::InvalidConfig("gravity must be finite".into()));
        }
        Ok(())
    }
}
