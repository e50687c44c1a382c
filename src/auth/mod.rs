//! Key-pair authentication: key loading, assertion minting, and the shared
//! per-identity assertion cache.

pub mod cache;
pub mod identity;
pub mod issuer;
pub mod key;

pub use cache::TokenCache;
pub use identity::Identity;
pub use issuer::{Assertion, AssertionClaims, TokenError, TokenIssuer};
pub use key::{KeyError, KeySource, SigningKey};
