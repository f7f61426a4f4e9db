//! JWT token capability consumed from the authorization service

use async_trait::async_trait;
use zstor_common::Result;

/// Provides a valid JWT token for a namespace
///
/// Implementations cache tokens and refresh them once expired. A returned
/// token is assumed valid; failures surface as ordinary request errors.
#[async_trait]
pub trait JwtTokenGetter: Send + Sync {
    /// Get a cached JWT token, or create a new one should it be invalid
    async fn get_jwt_token(&self, namespace: &str) -> Result<String>;
}
