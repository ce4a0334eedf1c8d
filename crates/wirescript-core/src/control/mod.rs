//! Control plane: run lifecycle and the controller session driver.

mod lifecycle;
mod session;

pub use lifecycle::{ControlState, FaultOrigin, Lifecycle};
pub use session::{ControlAction, ControlEvent, ControlSession, PROTOCOL_ERROR};
