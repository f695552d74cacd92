pub mod auth;
pub mod bootstrap;
pub mod classify;
pub mod core;
pub mod error;
pub mod handler;
pub mod maintenance;
pub mod mapping;

pub use auth::{AuthContext, Authenticator};
pub use classify::{ModelsSegmentRequest, classify_models_segment};
pub use core::{Core, CoreConfig};
pub use error::GatewayError;
pub use handler::{GatewayApi, router};
pub use maintenance::{MaintenanceConfig, spawn_maintenance_tasks};
