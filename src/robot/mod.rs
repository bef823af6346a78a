/// Hetzner Robot webservice client implementation
pub mod boot;
pub mod client;
pub mod error;
pub mod firewall;
pub mod models;
pub mod server;
pub mod vswitch;

pub use client::RobotClient;
pub use error::RobotError;
pub use models::ServerTarget;
