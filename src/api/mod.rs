//! The API gateway: the sole code path that issues network requests.

pub mod client;
pub mod error;
pub mod types;

pub use client::ApiClient;
pub use error::ApiError;
