pub mod broadcast;
pub mod gateway;
pub mod handlers;
pub mod rooms;
pub mod rpc;
pub mod server;
pub mod sessions;

pub use broadcast::Broadcaster;
pub use gateway::{GatewayConfig, RoomMode, SessionGateway};
pub use rooms::{Admission, ConnectionHandle, RoomRegistry};
pub use server::{start, ServerConfig, ServerDeps, ServerHandle};
pub use sessions::{SessionError, SessionService};

#[cfg(test)]
pub(crate) mod testing;
