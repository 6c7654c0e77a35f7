//! Per-remote config storage, metadata discovery, the OAuth 2.1 + PKCE
//! coordinator, and the inter-process handoff protocol that lets only one
//! live instance per remote open a browser.

pub mod coordinate;
pub mod discovery;
pub mod lock;
pub mod model;
pub mod oauth;
pub mod store;

pub use coordinate::AuthCoordination;
pub use model::{ClientInfo, LockInfo, ServerMetadata, Tokens};
pub use oauth::{BrowserOpener, OAuthCoordinator, OAuthCoordinatorConfig, SystemBrowserOpener};
pub use store::RemoteConfigStore;
