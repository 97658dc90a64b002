//! Background supervisors: retry, reconnect, keep-alive

pub mod keepalive;
pub mod reconnect;
pub mod retry;

pub use keepalive::KeepAlive;
pub use reconnect::{ControllerConnector, LossReason, LostPeer, ReconnectSupervisor};
pub use retry::RetrySupervisor;
