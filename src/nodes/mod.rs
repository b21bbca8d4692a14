pub mod handlers;
pub mod manager;
pub mod routes;

pub use manager::{HeartbeatRequest, JoinNodeRequest, JoinTokenRequest, NodeManager};
