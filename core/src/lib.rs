/// MatchChat - real-time conversation sync engine
///
/// Keeps per-counterpart transcripts consistent across a reconnecting duplex
/// transport, on-demand history loads, presence polling and optimistic sends.

pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod presence;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use backend::{ChatBackend, HttpBackend};
pub use config::Config;
pub use error::{ChatError, Result};
pub use events::{ConnectionEvent, SessionEvent};
pub use session::{ChatSession, ChatView};
pub use store::ConversationStore;
pub use transport::{ConnectionState, ConnectionSupervisor};
pub use types::{DeliveryStatus, LocalId, Message, UserId};
