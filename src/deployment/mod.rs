pub mod backend;
pub mod engine;
pub mod handlers;
pub mod models;
pub mod routes;

pub use engine::DeploymentEngine;
pub use models::{DeployRequest, ResolvedServiceDefinition};
