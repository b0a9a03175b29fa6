//! Void Collision - Scene Queries and Body Instances over Rapier 3D
//!
//! This crate translates engine-level collision queries into physics backend
//! queries and manages the per-component rigid body instances that live in
//! the backend scenes.
//!
//! # Features
//!
//! - Raycasts, shape sweeps and overlaps in test, single and multi flavours
//! - Channel/response filtering with block, touch and ignore semantics
//! - Backend hit conversion with penetration recovery and face remapping
//! - Body instances with scale, welding, filters, mass and dynamics
//! - Frame-deferred async traces collected one frame later
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                    PhysScene                     │
//! │  ┌──────────────┐ ┌──────────────┐ ┌───────────┐ │
//! │  │ BodyInstance │ │ MaterialLib  │ │ Observer  │ │
//! │  └──────────────┘ └──────────────┘ └───────────┘ │
//! │  ┌──────────────────────────────────────────────┐│
//! │  │   SceneSet: RwLock<RapierScene> (sync/async) ││
//! │  └──────────────────────────────────────────────┘│
//! └──────────────────────────────────────────────────┘
//!            │                         │
//!            ▼                         ▼
//!     ┌─────────────┐          ┌─────────────────┐
//!     │ SceneQuery  │◄─────────│AsyncTraceManager│
//!     │ filter/conv │          │ worker threads  │
//!     └─────────────┘          └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use void_collision::prelude::*;
//!
//! let mut phys = PhysScene::new(CollisionConfig::default())?;
//!
//! let floor = phys.create_body(BodyInstance::default());
//! let setup = BodySetup::from_geom(AggregateGeom::default().with_box(Vec3::zeros(), Vec3::new(500.0, 500.0, 10.0)));
//! phys.init_body(floor, Arc::new(setup), &Transform::identity(), BodyOwner::new(ComponentId(1)).with_static_mobility())?;
//!
//! let query = CollisionQuery::channel(CollisionChannel::Visibility);
//! let hit = phys.query().raycast_single(&Vec3::new(0.0, 0.0, 100.0), &Vec3::new(0.0, 0.0, -100.0), &query);
//! assert!(hit.blocking_hit);
//! ```

pub mod async_trace;
pub mod backend;
pub mod body;
pub mod body_setup;
pub mod config;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod hit;
pub mod identity;
pub mod material;
pub mod math;
pub mod observer;
pub mod params;
pub mod scene;
pub mod shape;

pub mod prelude {
    //! Common imports for collision queries and body instances
    pub use crate::async_trace::{
        AsyncTraceManager, AsyncTraceType, OverlapHandle, OverlapRequest, TraceHandle, TraceRequest,
    };
    pub use crate::backend::{RapierScene, SceneBackend};
    pub use crate::body::{
        BodyInstance, BodyOwner, CollisionEnabled, ComponentKind, Mobility, RadialFalloff, ScaleMode, SleepFamily,
    };
    pub use crate::body_setup::{AggregateGeom, BodySetup, CollisionTraceFlag, TriMeshData};
    pub use crate::config::CollisionConfig;
    pub use crate::dispatch::SceneQuery;
    pub use crate::error::{CollisionError, Result};
    pub use crate::filter::{CollisionChannel, CollisionResponse, ResponseContainer};
    pub use crate::hit::{HitResult, OverlapResult, QueryHits, QueryOverlaps};
    pub use crate::identity::{ActorId, BodyId, ComponentId, ShapeId};
    pub use crate::material::{MaterialId, PhysicalMaterial};
    pub use crate::math::{Quat, Transform, Vec3};
    pub use crate::observer::{CollisionObserver, NoopObserver};
    pub use crate::params::{CollisionQuery, CollisionQueryParams, ObjectQueryParams};
    pub use crate::scene::{CollisionNotify, PhysScene};
    pub use crate::shape::CollisionShape;
}

pub use prelude::*;
