use async_trait::async_trait;

use crate::error::Result;

/// Turns text into a vector.  Must be deterministic for identical input
/// within one model version.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
