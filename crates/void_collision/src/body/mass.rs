//! Mass properties of simulated bodies

use crate::error::Result;
use crate::identity::BodyId;
use crate::material::MaterialId;
use crate::math::{to_point, Vec3, KINDA_SMALL_NUMBER};
use crate::scene::PhysScene;
use rapier3d::parry::mass_properties::MassProperties;

/// Mass after the material's power curve and the body's mass scale
pub fn scale_mass(mass: f32, raise_mass_to_power: f32, mass_scale: f32) -> f32 {
    let power = raise_mass_to_power.clamp(KINDA_SMALL_NUMBER, 1.0);
    mass.powf(power) * mass_scale.clamp(0.01, 100.0)
}

impl PhysScene {
    /// Recompute the mass, inertia and centre of mass of a body's actor.
    ///
    /// Welded bodies update their root. Only shapes that take part in
    /// simulation contribute.
    pub fn update_mass_properties(&mut self, id: BodyId) -> Result<()> {
        self.initialized(id)?;
        let (root, _) = self.weld_root_of(id)?;
        let body = self.instance(root)?;
        if body.is_static() {
            return Ok(());
        }
        let Some(actor) = body.actors.first().copied() else {
            return Ok(());
        };
        let min_density = self.config.min_density * 0.001;
        let (root_material, _) = self.body_materials(body, crate::shape::ShapeKind::Box);
        let raise = self.materials.get(root_material).raise_mass_to_power;
        let (mass_scale, mass_override, com_nudge) = (body.mass_scale, body.mass_override, body.com_nudge);

        let computed = {
            let scene = self.scenes.scene(actor.scene)?.read();
            body.shapes
                .iter()
                .filter(|s| s.scene == actor.scene)
                .filter(|s| scene.shape_record(s.shape).map_or(false, |r| r.sim_enabled))
                .filter_map(|s| {
                    let origin = self.bodies.get(&s.origin)?;
                    let (material, _) = self.body_materials(origin, s.kind);
                    let density = (self.materials.get(material).density * 0.001).max(min_density);
                    scene.shape_mass_properties(s.shape, density)
                })
                .fold(MassProperties::default(), |acc, props| acc + props)
        };

        let old_mass = computed.mass();
        if old_mass <= 0.0 {
            log::debug!("Body {:?} has no simulated volume; mass left unchanged", root);
            self.instance_mut(root)?.mass_properties = None;
            return Ok(());
        }
        let new_mass = match mass_override {
            Some(mass) => mass.max(0.001),
            None => scale_mass(old_mass, raise, mass_scale),
        };
        let ratio = new_mass / old_mass;
        let props = MassProperties::with_principal_inertia_frame(
            to_point(&(computed.local_com.coords + com_nudge)),
            new_mass,
            computed.principal_inertia() * ratio,
            computed.principal_inertia_local_frame,
        );

        self.scenes
            .scene(actor.scene)?
            .write()
            .set_mass_properties(actor.handle, props);
        self.instance_mut(root)?.mass_properties = Some(props);
        log::trace!("Body {:?} mass {} kg (computed {})", root, new_mass, old_mass);
        Ok(())
    }

    /// Mass in kg; zero for bodies that do not simulate
    pub fn body_mass(&self, id: BodyId) -> Result<f32> {
        self.initialized(id)?;
        let (root, _) = self.weld_root_of(id)?;
        Ok(self
            .instance(root)?
            .mass_properties
            .map_or(0.0, |p| p.mass()))
    }

    /// Principal inertia in kg·cm²
    pub fn body_inertia_tensor(&self, id: BodyId) -> Result<Vec3> {
        self.initialized(id)?;
        let (root, _) = self.weld_root_of(id)?;
        Ok(self
            .instance(root)?
            .mass_properties
            .map_or_else(Vec3::zeros, |p| p.principal_inertia()))
    }

    /// Centre of mass in the body's local frame
    pub fn body_center_of_mass(&self, id: BodyId) -> Result<Vec3> {
        self.initialized(id)?;
        let (root, _) = self.weld_root_of(id)?;
        Ok(self
            .instance(root)?
            .mass_properties
            .map_or_else(Vec3::zeros, |p| p.local_com.coords))
    }

    pub fn set_mass_scale(&mut self, id: BodyId, scale: f32) -> Result<()> {
        self.instance_mut(id)?.mass_scale = scale;
        self.refresh_mass(id)
    }

    pub fn set_mass_override(&mut self, id: BodyId, mass: Option<f32>) -> Result<()> {
        self.instance_mut(id)?.mass_override = mass;
        self.refresh_mass(id)
    }

    pub fn set_center_of_mass_nudge(&mut self, id: BodyId, nudge: &Vec3) -> Result<()> {
        self.instance_mut(id)?.com_nudge = *nudge;
        self.refresh_mass(id)
    }

    /// Replace the material of every shape the body created
    pub fn set_phys_material_override(&mut self, id: BodyId, material: Option<MaterialId>) -> Result<()> {
        self.instance_mut(id)?.phys_material_override = material;
        if !self.instance(id)?.is_initialized() {
            return Ok(());
        }
        let (root, _) = self.weld_root_of(id)?;
        self.apply_materials(root)?;
        self.refresh_mass(id)
    }

    /// Push resolved surface properties and material lists to every shape on `root`
    pub(crate) fn apply_materials(&mut self, root: BodyId) -> Result<()> {
        let shapes = self.instance(root)?.shapes.clone();
        for shape in &shapes {
            let Some(origin) = self.bodies.get(&shape.origin) else {
                continue;
            };
            let (simple, materials) = self.body_materials(origin, shape.kind);
            let surface = self.materials.get(simple);
            let mut scene = self.scenes.scene(shape.scene)?.write();
            scene.set_shape_surface(
                shape.shape,
                surface.friction,
                surface.restitution,
                surface.friction_combine,
                surface.restitution_combine,
            );
            if let Some(identity) = scene.identity_mut(shape.shape) {
                identity.materials = materials;
            }
        }
        Ok(())
    }

    fn refresh_mass(&mut self, id: BodyId) -> Result<()> {
        let body = self.instance(id)?;
        if !body.is_initialized() {
            return Ok(());
        }
        let (root, _) = self.weld_root_of(id)?;
        if self.instance(root)?.is_dynamic() {
            self.update_mass_properties(root)?;
        }
        Ok(())
    }
}
