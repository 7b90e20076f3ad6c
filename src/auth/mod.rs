//! Bearer-token authentication: issuance, validation, revocation, and
//! header parsing.

pub mod bearer;
pub mod tokens;

pub use bearer::{authenticate, verify_client, Caller};
pub use tokens::{IssuedToken, TokenRecord, TokenResponse, TokenService};
