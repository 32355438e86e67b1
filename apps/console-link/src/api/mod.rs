//! Authenticated request pipeline.

pub mod client;
pub mod error;
mod refresh;

pub use client::{ApiClient, ApiClientBuilder};
pub use error::{ApiError, RefreshFailure};
