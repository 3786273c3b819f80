/// Duplex transport: wire frames, reconnect policy, connection supervisor
pub mod backoff;
pub mod frame;
pub mod supervisor;

pub use backoff::ReconnectPolicy;
pub use frame::Frame;
pub use supervisor::{ConnectionState, ConnectionSupervisor};
