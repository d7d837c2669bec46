pub mod sigv4;
pub mod signer;

pub use signer::apply_auth;
pub use sigv4::{sign_sigv4, SigV4Headers, SigV4Timestamp};
