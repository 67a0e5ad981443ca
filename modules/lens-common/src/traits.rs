use anyhow::Result;
use async_trait::async_trait;

use crate::types::{AnalystOutput, DiscoveredPost, FetchedPost, RawComment, VisionV1, VisionV2};

/// Text embedding capability. Implementations are thread-safe singletons.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Fetches and parses one post URL through the external scraper.
#[async_trait]
pub trait PostFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPost>;
}

/// Keyword discovery against the external scraper's search surface.
#[async_trait]
pub trait KeywordDiscoverer: Send + Sync {
    async fn discover(&self, keyword: &str, max_posts: usize) -> Result<Vec<DiscoveredPost>>;
}

/// The narrative analyst LLM.
#[async_trait]
pub trait Analyst: Send + Sync {
    async fn analyze(
        &self,
        post: &FetchedPost,
        comments: &[RawComment],
        cluster_summary: Option<&serde_json::Value>,
    ) -> Result<AnalystOutput>;
}

/// Two-stage image analysis.
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn run_v1(&self, image_url: &str) -> Result<VisionV1>;
    async fn run_v2(&self, image_url: &str) -> Result<VisionV2>;
}
