//! Mock capability implementations for boundary tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;

use lens_common::{
    Analyst, AnalystOutput, DiscoveredPost, FetchedPost, KeywordDiscoverer, PostFetcher,
    RawComment, Stage, TextEmbedder, VisionAnalyzer, VisionV1, VisionV2,
};

use crate::stage::StageReporter;

/// Scripted fetcher: URLs map to canned posts; everything else errors.
#[derive(Default)]
pub struct MockFetcher {
    posts: HashMap<String, FetchedPost>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_url(mut self, url: &str, post: FetchedPost) -> Self {
        self.posts.insert(url.to_string(), post);
        self
    }
}

#[async_trait]
impl PostFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPost> {
        self.posts
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("no scripted post for {url}"))
    }
}

/// Discovery that returns a fixed candidate list regardless of keyword.
pub struct MockDiscoverer {
    pub candidates: Vec<DiscoveredPost>,
}

#[async_trait]
impl KeywordDiscoverer for MockDiscoverer {
    async fn discover(&self, _keyword: &str, max_posts: usize) -> Result<Vec<DiscoveredPost>> {
        Ok(self.candidates.iter().take(max_posts).cloned().collect())
    }
}

/// Deterministic embedder: a low-dimension vector derived from text bytes.
pub struct FixedEmbedder {
    pub dim: usize,
}

impl FixedEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

#[async_trait]
impl TextEmbedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dim];
        for (i, b) in text.bytes().enumerate() {
            v[i % self.dim] += b as f32 / 255.0;
        }
        Ok(v)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }
}

/// Analyst returning a fixed payload and report.
pub struct MockAnalyst {
    pub payload: serde_json::Value,
    pub report: String,
}

impl Default for MockAnalyst {
    fn default() -> Self {
        Self {
            payload: json!({
                "summary": {"one_line": "a test narrative", "narrative_type": "test"},
                "Tone_Fingerprint": {"primary": "irony", "cynicism": 0.4},
            }),
            report: "L1: Speech Act Theory\ntest acts\n".to_string(),
        }
    }
}

#[async_trait]
impl Analyst for MockAnalyst {
    async fn analyze(
        &self,
        _post: &FetchedPost,
        _comments: &[RawComment],
        _cluster_summary: Option<&serde_json::Value>,
    ) -> Result<AnalystOutput> {
        Ok(AnalystOutput {
            llm_payload: self.payload.clone(),
            full_report: self.report.clone(),
            ai_tags: json!({}),
        })
    }
}

/// Vision worker with scripted V1/V2 results.
pub struct MockVision {
    pub v1: VisionV1,
    pub v2: VisionV2,
    pub fail_v1: bool,
}

impl Default for MockVision {
    fn default() -> Self {
        Self {
            v1: VisionV1 {
                category: Some("meme".to_string()),
                has_text: true,
                is_screenshot: false,
                text_density: Some("high".to_string()),
                notes: Some("dense caption".to_string()),
            },
            v2: VisionV2 {
                scene_label: Some("mocked scene".to_string()),
                extracted_text: Some("ocr text".to_string()),
                context_desc: Some("context".to_string()),
                visual_rhetoric: Some("irony".to_string()),
            },
            fail_v1: false,
        }
    }
}

#[async_trait]
impl VisionAnalyzer for MockVision {
    async fn run_v1(&self, _image_url: &str) -> Result<VisionV1> {
        if self.fail_v1 {
            return Err(anyhow!("soft-block: 403"));
        }
        Ok(self.v1.clone())
    }

    async fn run_v2(&self, _image_url: &str) -> Result<VisionV2> {
        Ok(self.v2.clone())
    }
}

/// Records every reported stage for assertions.
#[derive(Default)]
pub struct RecordingReporter {
    stages: Mutex<Vec<Stage>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.stages.lock().expect("reporter lock").clone()
    }
}

#[async_trait]
impl StageReporter for RecordingReporter {
    async fn report(&self, stage: &Stage) {
        self.stages.lock().expect("reporter lock").push(stage.clone());
    }
}

/// A minimal scripted post for pipeline tests.
pub fn fetched_post(url: &str, text: &str, comments: &[(&str, &str, i64)]) -> FetchedPost {
    FetchedPost {
        url: url.to_string(),
        author: "tester".to_string(),
        post_text: text.to_string(),
        comments: comments
            .iter()
            .map(|(user, text, likes)| RawComment {
                author_handle: Some(user.to_string()),
                text: text.to_string(),
                like_count: *likes,
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}
