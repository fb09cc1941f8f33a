//! Client-side realtime synchronization: one WebSocket link with automatic
//! reconnect, channel subscriptions that survive reconnects, optimistic
//! writes reconciled against server echoes, and presence/unread tracking.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod identity;
pub mod presence;
pub mod reconciler;
pub mod session;
pub mod subscriptions;
pub mod transport;
pub mod types;

pub use config::{load_settings, load_settings_from, SyncSettings};
pub use dispatcher::EventKind;
pub use error::SyncError;
pub use http::{ReqwestClient, RequestClient};
pub use identity::{CredentialStore, Credentials, IdentityProvider};
pub use session::{SubmitHandle, SyncSession};
pub use transport::{Connector, WsConnector};
pub use types::{ConnectionState, Message, MessageOrigin, SyncEvent};
