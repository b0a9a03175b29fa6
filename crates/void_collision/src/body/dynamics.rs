//! Velocities, forces and sleep state of simulated bodies
//!
//! Everything here acts on the actor hosting the body's shapes, so welded
//! bodies drive their root. Force and velocity operations do nothing on
//! static or kinematic actors.

use super::SceneActor;
use crate::error::Result;
use crate::identity::BodyId;
use crate::math::{safe_normal, to_point, Vec3};
use crate::scene::PhysScene;
use rapier3d::na::Matrix3;
use rapier3d::prelude::RigidBody;
use serde::{Deserialize, Serialize};

/// Solver iterations the backend runs for every body
const BACKEND_SOLVER_ITERATIONS: u32 = 4;

/// Sleep threshold preset of a body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SleepFamily {
    #[default]
    Normal,
    /// Twenty times lower thresholds, for slow-moving bodies
    Sensitive,
    /// Scene thresholds times `custom_sleep_threshold_multiplier`
    Custom,
}

/// Strength of radial forces over distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RadialFalloff {
    #[default]
    Constant,
    /// Full strength at the origin, zero at the radius
    Linear,
}

impl RadialFalloff {
    fn scale(self, distance: f32, radius: f32) -> f32 {
        match self {
            Self::Constant => 1.0,
            Self::Linear => (1.0 - distance / radius).max(0.0),
        }
    }
}

impl PhysScene {
    /// The actor that moves `id`, if it can be driven at all
    fn driving_actor(&self, id: BodyId, dynamic_only: bool) -> Result<Option<SceneActor>> {
        self.initialized(id)?;
        let (root, _) = self.weld_root_of(id)?;
        let root_body = self.instance(root)?;
        if root_body.is_static() || (dynamic_only && !root_body.is_dynamic()) {
            return Ok(None);
        }
        Ok(root_body.actors.first().copied())
    }

    fn with_actor<R>(&self, id: BodyId, dynamic_only: bool, f: impl FnOnce(&mut RigidBody) -> R) -> Result<Option<R>> {
        let Some(actor) = self.driving_actor(id, dynamic_only)? else {
            return Ok(None);
        };
        let mut scene = self.scenes.scene(actor.scene)?.write();
        Ok(scene.body_mut(actor.handle).map(f))
    }

    fn read_actor<R>(&self, id: BodyId, f: impl FnOnce(&RigidBody) -> R) -> Result<Option<R>> {
        let Some(actor) = self.driving_actor(id, false)? else {
            return Ok(None);
        };
        let scene = self.scenes.scene(actor.scene)?.read();
        Ok(scene.body(actor.handle).map(f))
    }

    // ==================== Velocity ====================

    pub fn set_linear_velocity(&mut self, id: BodyId, velocity: &Vec3, add_to_current: bool) -> Result<()> {
        self.with_actor(id, true, |rb| {
            let velocity = if add_to_current { rb.linvel() + velocity } else { *velocity };
            rb.set_linvel(velocity, true);
        })?;
        Ok(())
    }

    pub fn linear_velocity(&self, id: BodyId) -> Result<Vec3> {
        Ok(self.read_actor(id, |rb| *rb.linvel())?.unwrap_or_else(Vec3::zeros))
    }

    /// Angular velocity in degrees per second
    pub fn set_angular_velocity(&mut self, id: BodyId, degrees: &Vec3, add_to_current: bool) -> Result<()> {
        let radians = degrees.map(f32::to_radians);
        self.with_actor(id, true, |rb| {
            let velocity = if add_to_current { rb.angvel() + radians } else { radians };
            rb.set_angvel(velocity, true);
        })?;
        Ok(())
    }

    /// Angular velocity in degrees per second
    pub fn angular_velocity(&self, id: BodyId) -> Result<Vec3> {
        Ok(self
            .read_actor(id, |rb| rb.angvel().map(f32::to_degrees))?
            .unwrap_or_else(Vec3::zeros))
    }

    /// Velocity of the point `world_point` rigidly attached to the body
    pub fn velocity_at_point(&self, id: BodyId, world_point: &Vec3) -> Result<Vec3> {
        Ok(self
            .read_actor(id, |rb| rb.velocity_at_point(&to_point(world_point)))?
            .unwrap_or_else(Vec3::zeros))
    }

    /// Clamp applied after every step, in degrees per second
    pub fn set_max_angular_velocity(&mut self, id: BodyId, degrees: Option<f32>) -> Result<()> {
        self.instance_mut(id)?.max_angular_velocity = degrees.map(f32::abs);
        Ok(())
    }

    pub fn set_max_depenetration_velocity(&mut self, id: BodyId, velocity: Option<f32>) -> Result<()> {
        self.instance_mut(id)?.max_depenetration_velocity = velocity.map(f32::abs);
        Ok(())
    }

    // ==================== Properties ====================

    pub fn set_enable_gravity(&mut self, id: BodyId, enable: bool) -> Result<()> {
        self.instance_mut(id)?.enable_gravity = enable;
        if !self.instance(id)?.is_initialized() {
            return Ok(());
        }
        self.with_actor(id, false, |rb| {
            rb.set_gravity_scale(if enable { 1.0 } else { 0.0 }, enable);
        })?;
        Ok(())
    }

    /// Continuous collision detection; also flags the body's shapes
    pub fn set_use_ccd(&mut self, id: BodyId, enable: bool) -> Result<()> {
        let body = self.instance_mut(id)?;
        let changed = body.use_ccd != enable;
        body.use_ccd = enable;
        if !body.is_initialized() {
            return Ok(());
        }
        self.with_actor(id, false, |rb| rb.enable_ccd(enable))?;
        if changed {
            self.update_physics_filter_data(id)?;
        }
        Ok(())
    }

    /// Position solver iterations, clamped to 1..=255
    pub fn set_solver_iterations(&mut self, id: BodyId, iterations: u32) -> Result<()> {
        let iterations = iterations.clamp(1, 255);
        self.instance_mut(id)?.position_solver_iterations = iterations;
        if !self.instance(id)?.is_initialized() {
            return Ok(());
        }
        let additional = iterations.saturating_sub(BACKEND_SOLVER_ITERATIONS) as usize;
        self.with_actor(id, false, |rb| rb.set_additional_solver_iterations(additional))?;
        Ok(())
    }

    pub fn set_damping(&mut self, id: BodyId, linear: f32, angular: f32) -> Result<()> {
        let body = self.instance_mut(id)?;
        body.linear_damping = linear.max(0.0);
        body.angular_damping = angular.max(0.0);
        let (linear, angular) = (body.linear_damping, body.angular_damping);
        if !body.is_initialized() {
            return Ok(());
        }
        self.with_actor(id, false, |rb| {
            rb.set_linear_damping(linear);
            rb.set_angular_damping(angular);
        })?;
        Ok(())
    }

    pub fn set_sleep_family(&mut self, id: BodyId, family: SleepFamily, custom_multiplier: f32) -> Result<()> {
        let body = self.instance_mut(id)?;
        body.sleep_family = family;
        body.custom_sleep_threshold_multiplier = custom_multiplier;
        if body.is_initialized() {
            self.apply_sleep_threshold(id)?;
        }
        Ok(())
    }

    /// Push the body's sleep thresholds to its actor
    pub fn apply_sleep_threshold(&mut self, id: BodyId) -> Result<()> {
        let body = self.initialized(id)?;
        let multiplier = match body.sleep_family {
            SleepFamily::Normal => 1.0,
            SleepFamily::Sensitive => 1.0 / 20.0,
            SleepFamily::Custom => body.custom_sleep_threshold_multiplier.max(0.0),
        };
        let linear = self.config.sleep_linear_threshold * multiplier;
        let angular = self.config.sleep_angular_threshold * multiplier;
        self.with_actor(id, false, |rb| {
            let activation = rb.activation_mut();
            activation.normalized_linear_threshold = linear;
            activation.angular_threshold = angular;
        })?;
        Ok(())
    }

    // ==================== Sleep ====================

    pub fn is_awake(&self, id: BodyId) -> Result<bool> {
        Ok(self.read_actor(id, |rb| rb.is_dynamic() && !rb.is_sleeping())?.unwrap_or(false))
    }

    pub fn wake(&mut self, id: BodyId) -> Result<()> {
        self.with_actor(id, true, |rb| rb.wake_up(true))?;
        Ok(())
    }

    pub fn put_to_sleep(&mut self, id: BodyId) -> Result<()> {
        self.with_actor(id, true, |rb| rb.sleep())?;
        Ok(())
    }

    // ==================== Forces ====================

    /// Continuous force; `accel_change` treats `force` as an acceleration
    pub fn add_force(&mut self, id: BodyId, force: &Vec3, accel_change: bool) -> Result<()> {
        self.with_actor(id, true, |rb| {
            let force = if accel_change { force * rb.mass() } else { *force };
            rb.add_force(force, true);
        })?;
        Ok(())
    }

    pub fn add_force_at_position(&mut self, id: BodyId, force: &Vec3, world_point: &Vec3) -> Result<()> {
        self.with_actor(id, true, |rb| rb.add_force_at_point(*force, to_point(world_point), true))?;
        Ok(())
    }

    /// Torque in kg·cm²/s²; `accel_change` treats it as an angular acceleration in rad/s²
    pub fn add_torque(&mut self, id: BodyId, torque: &Vec3, accel_change: bool) -> Result<()> {
        let inertia = self.world_inertia(id)?;
        self.with_actor(id, true, |rb| {
            let torque = match (accel_change, inertia) {
                (true, Some(inertia)) => inertia * torque,
                _ => *torque,
            };
            rb.add_torque(torque, true);
        })?;
        Ok(())
    }

    /// Instant impulse; `vel_change` treats it as a velocity change
    pub fn add_impulse(&mut self, id: BodyId, impulse: &Vec3, vel_change: bool) -> Result<()> {
        self.with_actor(id, true, |rb| {
            let impulse = if vel_change { impulse * rb.mass() } else { *impulse };
            rb.apply_impulse(impulse, true);
        })?;
        Ok(())
    }

    pub fn add_impulse_at_position(&mut self, id: BodyId, impulse: &Vec3, world_point: &Vec3) -> Result<()> {
        self.with_actor(id, true, |rb| rb.apply_impulse_at_point(*impulse, to_point(world_point), true))?;
        Ok(())
    }

    /// Angular impulse; `vel_change` treats it as an angular velocity change in rad/s
    pub fn add_angular_impulse(&mut self, id: BodyId, impulse: &Vec3, vel_change: bool) -> Result<()> {
        let inertia = self.world_inertia(id)?;
        self.with_actor(id, true, |rb| {
            let impulse = match (vel_change, inertia) {
                (true, Some(inertia)) => inertia * impulse,
                _ => *impulse,
            };
            rb.apply_torque_impulse(impulse, true);
        })?;
        Ok(())
    }

    /// Impulse pushing the body away from `origin`; nothing beyond `radius`
    pub fn add_radial_impulse(
        &mut self,
        id: BodyId,
        origin: &Vec3,
        radius: f32,
        strength: f32,
        falloff: RadialFalloff,
        vel_change: bool,
    ) -> Result<()> {
        self.with_actor(id, true, |rb| {
            if let Some(push) = radial_push(rb, origin, radius, strength, falloff) {
                let impulse = if vel_change { push * rb.mass() } else { push };
                rb.apply_impulse(impulse, true);
            }
        })?;
        Ok(())
    }

    /// Force pushing the body away from `origin`; nothing beyond `radius`
    pub fn add_radial_force(
        &mut self,
        id: BodyId,
        origin: &Vec3,
        radius: f32,
        strength: f32,
        falloff: RadialFalloff,
        accel_change: bool,
    ) -> Result<()> {
        self.with_actor(id, true, |rb| {
            if let Some(push) = radial_push(rb, origin, radius, strength, falloff) {
                let force = if accel_change { push * rb.mass() } else { push };
                rb.add_force(force, true);
            }
        })?;
        Ok(())
    }

    /// Inertia tensor of the body's root in world space
    fn world_inertia(&self, id: BodyId) -> Result<Option<Matrix3<f32>>> {
        let (root, _) = self.weld_root_of(id)?;
        let Some(props) = self.instance(root)?.mass_properties else {
            return Ok(None);
        };
        self.read_actor(id, |rb| {
            let frame = (rb.rotation() * props.principal_inertia_local_frame).to_rotation_matrix();
            frame.matrix() * Matrix3::from_diagonal(&props.principal_inertia()) * frame.matrix().transpose()
        })
    }
}

fn radial_push(rb: &RigidBody, origin: &Vec3, radius: f32, strength: f32, falloff: RadialFalloff) -> Option<Vec3> {
    let delta = rb.center_of_mass().coords - origin;
    let distance = delta.norm();
    if distance > radius {
        return None;
    }
    let direction = safe_normal(&delta)?;
    Some(direction * strength * falloff.scale(distance, radius))
}
