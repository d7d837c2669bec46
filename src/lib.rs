pub mod auth;
pub mod config;
pub mod credential;
pub mod dispatch;
mod error;
pub mod http;
pub mod metrics;
pub mod openai;
pub mod platform;
pub mod providers;
pub mod registry;
pub mod router;
pub mod translate;
pub mod utils;

pub use config::{Config, Dialect, InstanceMode, ProviderKind};
pub use credential::{Credential, CredentialManager};
pub use dispatch::{Dispatcher, ProtocolReply};
pub use error::{ErrorBody, ErrorDetail, JanusError, Result};
pub use http::{router, GatewayState};
pub use platform::PlatformCapabilities;
pub use registry::InstanceRegistry;
