//! Nimbus SDK
//!
//! Signed HTTP access to the cloud APIs: request signing, a JSON client with
//! classified errors, endpoint resolution, pagination and job tracking.

pub mod client;
pub mod endpoints;
pub mod error;
pub mod jobs;
pub mod pagination;
pub mod signer;

pub use client::{ApiClient, ClientConfig};
pub use endpoints::Endpoints;
pub use error::{ErrorClass, SdkError};
pub use signer::Credentials;
