//! Streaming channel protocol.
//!
//! A [`ChannelSession`] drives one named channel through host discovery,
//! channel open, chained row inserts, status reads and close. See
//! [`ChannelState`] for the state machine.

mod errors;
mod registry;
mod session;
mod state;
mod wire;

pub use errors::SessionError;
pub(crate) use registry::ChannelRegistry;
pub use session::{ChannelSession, InsertReceipt};
pub use state::{ChannelHandle, ChannelState};
pub use wire::ChannelStatus;
