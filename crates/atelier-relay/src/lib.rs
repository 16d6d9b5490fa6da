pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod session;
pub mod store;
pub mod token;

pub use dispatcher::Relay;
pub use error::RelayError;
pub use registry::{ChannelHandle, ConnectionRegistry};
pub use session::{Role, Session};
pub use store::{IdentityProvider, MessageStore};
