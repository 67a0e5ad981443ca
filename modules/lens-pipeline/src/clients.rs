//! Capability adapters over the external service clients.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use gemini_client::GeminiClient;
use lens_common::{
    Analyst, AnalystOutput, DiscoveredPost, FetchedPost, KeywordDiscoverer, PostFetcher,
    RawComment, TextEmbedder, VisionAnalyzer, VisionV1, VisionV2,
};
use threads_client::ThreadsClient;

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

pub struct GeminiEmbedder {
    client: GeminiClient,
}

impl GeminiEmbedder {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: GeminiClient::new(api_key),
        }
    }
}

#[async_trait]
impl TextEmbedder for GeminiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Err(anyhow!("embed: empty text provided"));
        }
        Ok(self.client.embed(text).await?)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(self.client.embed_batch(texts).await?)
    }
}

// ---------------------------------------------------------------------------
// Scraper
// ---------------------------------------------------------------------------

pub struct ScraperFetcher {
    client: ThreadsClient,
}

impl ScraperFetcher {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            client: ThreadsClient::new(base_url, token),
        }
    }
}

#[async_trait]
impl PostFetcher for ScraperFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPost> {
        Ok(self.client.fetch_post(url).await?)
    }
}

#[async_trait]
impl KeywordDiscoverer for ScraperFetcher {
    async fn discover(&self, keyword: &str, max_posts: usize) -> Result<Vec<DiscoveredPost>> {
        Ok(self.client.search(keyword, max_posts).await?)
    }
}

// ---------------------------------------------------------------------------
// Vision
// ---------------------------------------------------------------------------

pub struct GeminiVision {
    client: GeminiClient,
    http: reqwest::Client,
}

impl GeminiVision {
    pub fn new(api_key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client: GeminiClient::new(api_key),
            http,
        }
    }

    /// Download the image into a temp file and read it back. The file is
    /// removed on drop, covering every exit path.
    async fn download(&self, image_url: &str) -> Result<(Vec<u8>, String)> {
        let resp = self
            .http
            .get(image_url)
            .send()
            .await
            .context("image download failed")?;
        if !resp.status().is_success() {
            return Err(anyhow!("image download status {}", resp.status()));
        }
        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .split(';')
            .next()
            .unwrap_or("image/jpeg")
            .to_string();
        if !mime.starts_with("image/") {
            return Err(anyhow!("soft-block: non-image content type {mime}"));
        }
        let bytes = resp.bytes().await?;

        let tmp = tempfile::NamedTempFile::new()?;
        std::fs::write(tmp.path(), &bytes)?;
        let read_back = std::fs::read(tmp.path())?;
        Ok((read_back, mime))
    }
}

const V1_PROMPT: &str = "Classify this social-media image. Respond with JSON: \
{\"category\": string, \"has_text\": bool, \"is_screenshot\": bool, \
\"text_density\": \"low\"|\"medium\"|\"high\", \"notes\": string}";

const V2_PROMPT: &str = "Extract everything analytically useful from this image. Respond with JSON: \
{\"scene_label\": string, \"extracted_text\": string (verbatim OCR of all visible text), \
\"context_desc\": string, \"visual_rhetoric\": string (framing/persuasion devices, if any)}";

#[async_trait]
impl VisionAnalyzer for GeminiVision {
    async fn run_v1(&self, image_url: &str) -> Result<VisionV1> {
        let (bytes, mime) = self.download(image_url).await?;
        let value = self
            .client
            .generate_json_with_image(V1_PROMPT, &mime, &bytes)
            .await?;
        debug!(image_url, "Vision V1 complete");
        Ok(serde_json::from_value(value)?)
    }

    async fn run_v2(&self, image_url: &str) -> Result<VisionV2> {
        let (bytes, mime) = self.download(image_url).await?;
        let value = self
            .client
            .generate_json_with_image(V2_PROMPT, &mime, &bytes)
            .await?;
        debug!(image_url, "Vision V2 complete");
        Ok(serde_json::from_value(value)?)
    }
}

// ---------------------------------------------------------------------------
// Analyst
// ---------------------------------------------------------------------------

pub struct GeminiAnalyst {
    client: GeminiClient,
}

impl GeminiAnalyst {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: GeminiClient::new(api_key),
        }
    }

    fn build_prompt(
        post: &FetchedPost,
        comments: &[RawComment],
        cluster_summary: Option<&Value>,
    ) -> String {
        let mut comment_lines = String::new();
        for (i, c) in comments.iter().take(120).enumerate() {
            let user = c.author_handle.as_deref().unwrap_or("Unknown");
            let text = c.text.replace('\n', " ");
            comment_lines.push_str(&format!(
                "[{}] User: {user} | Likes: {} | Content: {text}\n",
                i + 1,
                c.like_count
            ));
        }

        let visuals = post
            .images
            .iter()
            .enumerate()
            .map(|(i, img)| {
                format!(
                    "[Image {}] scene: {} | text: {} | context: {}",
                    i + 1,
                    img.scene_label.as_deref().unwrap_or("N/A"),
                    img.full_text.as_deref().unwrap_or(""),
                    img.context_desc.as_deref().unwrap_or(""),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let cluster_block = cluster_summary
            .map(|c| c.to_string())
            .unwrap_or_else(|| "{}".to_string());

        format!(
            r#"You are a narrative analyst for social-media discourse. Produce a markdown
report with three layered sections, each starting with its marker on its own
line:

L1: Speech Act Theory. What the post is doing, not just saying.
L2: Critical Discourse Analysis. Framing, strategy, and power moves.
L3: Battlefield. Factions in the replies and how they align.

After the report, emit one fenced ```json block with exactly these keys:
{{
  "summary": {{"one_line": str, "narrative_type": str}},
  "layers": {{"l1": {{"summary": str}}, "l2": {{"summary": str}}, "l3": {{"summary": str}}}},
  "Tone_Fingerprint": {{"primary": str, "cynicism": 0..1, "hope": 0..1, "anger": 0..1, "notes": str}},
  "battlefield": {{"factions": [{{"label": str, "share": 0..1, "samples": [{{"text": str, "likes": int}}]}}]}},
  "danger": {{"bot_homogeneity_score": 0..1, "notes": str}},
  "Post_Stats": {{"Likes": int, "Replies": int, "Views": int}},
  "Cluster_Insights": [{{"cluster_key": int, "label": str, "summary": str, "tactics": [str], "tactic_summary": str}}],
  "Discovery_Channel": {{"Sub_Variant_Name": str, "Is_New_Phenomenon": bool, "Phenomenon_Description": str}},
  "Quantifiable_Tags": {{"Homogeneity_Score": 0..1, "Sentiment": str}}
}}

POST by @{author}:
{text}

METRICS (crawler ground truth, do not restate different numbers):
likes={likes} views={views} replies={replies}

VISUALS:
{visuals}

COMMENT CLUSTERS (statistical reference):
{clusters}

COMMENTS:
{comments}
"#,
            author = post.author,
            text = post.post_text,
            likes = post.metrics.likes,
            views = post.metrics.views,
            replies = post.metrics.reply_count,
            visuals = if visuals.is_empty() { "No visuals." } else { &visuals },
            clusters = cluster_block,
            comments = comment_lines,
        )
    }
}

#[async_trait]
impl Analyst for GeminiAnalyst {
    async fn analyze(
        &self,
        post: &FetchedPost,
        comments: &[RawComment],
        cluster_summary: Option<&Value>,
    ) -> Result<AnalystOutput> {
        let prompt = Self::build_prompt(post, comments, cluster_summary);
        info!(chars = prompt.len(), "Analyst prompt ready");

        let full_report = self.client.generate(&prompt, 0.4).await?;
        let llm_payload = extract_json_block(&full_report).unwrap_or_else(|| json!({}));

        let tags = llm_payload
            .get("Quantifiable_Tags")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let discovery = llm_payload.get("Discovery_Channel");
        let mut ai_tags = tags;
        if let Some(obj) = ai_tags.as_object_mut() {
            obj.insert(
                "Sub_Variant".to_string(),
                discovery
                    .and_then(|d| d.get("Sub_Variant_Name"))
                    .cloned()
                    .unwrap_or(Value::Null),
            );
            obj.insert(
                "Phenomenon_Desc".to_string(),
                discovery
                    .and_then(|d| d.get("Phenomenon_Description"))
                    .cloned()
                    .unwrap_or(Value::Null),
            );
        }

        Ok(AnalystOutput {
            llm_payload,
            full_report,
            ai_tags,
        })
    }
}

/// Pull the structured payload out of a markdown report: prefer the fenced
/// ```json block, fall back to the last balanced object in the text.
pub fn extract_json_block(text: &str) -> Option<Value> {
    if let Some(start) = text.find("```json") {
        let body = &text[start + 7..];
        if let Some(end) = body.find("```") {
            if let Ok(v) = serde_json::from_str::<Value>(body[..end].trim()) {
                if v.is_object() {
                    return Some(v);
                }
            }
        }
    }

    // Scan balanced top-level objects and keep the last parseable one.
    let bytes = text.as_bytes();
    let mut best: Option<Value> = None;
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start {
                            if let Ok(v) = serde_json::from_str::<Value>(&text[s..=i]) {
                                if v.is_object() {
                                    best = Some(v);
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let text = "report body\n```json\n{\"summary\": {\"one_line\": \"x\"}}\n```\ntail";
        let v = extract_json_block(text).unwrap();
        assert_eq!(v["summary"]["one_line"], "x");
    }

    #[test]
    fn falls_back_to_last_balanced_object() {
        let text = "noise {\"a\": 1} more noise {\"b\": {\"c\": 2}} end";
        let v = extract_json_block(text).unwrap();
        assert_eq!(v["b"]["c"], 2);
    }

    #[test]
    fn braces_inside_strings_do_not_break_scan() {
        let text = "x {\"k\": \"va{lue}\"} y";
        let v = extract_json_block(text).unwrap();
        assert_eq!(v["k"], "va{lue}");
    }

    #[test]
    fn no_json_returns_none() {
        assert!(extract_json_block("just prose, no payload").is_none());
    }
}
