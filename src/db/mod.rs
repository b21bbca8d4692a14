pub mod cloud_instances;
pub mod clusters;
pub mod deployments;
pub mod join_tokens;
pub mod models;
pub mod unodes;
pub mod users;

pub use models::*;
