pub mod error;
pub mod urls;

pub use error::{Result, ThreadsError};
pub use urls::{canonicalize_url, normalize_url, trailing_shortcode};

use std::time::Duration;

use lens_common::{DiscoveredPost, FetchedPost};
use tracing::debug;

/// Client for the headless scraper service that renders Threads pages and
/// returns parsed post structures.
pub struct ThreadsClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ThreadsClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let mut url = format!("{}{path}", self.base_url);
        if let Some(ref token) = self.token {
            url.push_str(&format!("?token={token}"));
        }
        url
    }

    /// Fetch and parse a single post page.
    pub async fn fetch_post(&self, url: &str) -> Result<FetchedPost> {
        debug!(url, "Scraper fetch_post");
        let body = serde_json::json!({ "url": url });

        let resp = self
            .http
            .post(self.endpoint("/scrape/post"))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ThreadsError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let text = resp.text().await?;
        let mut post: FetchedPost = serde_json::from_str(&text)?;
        post.url = normalize_url(&post.url);
        Ok(post)
    }

    /// Keyword search. Returns candidate post URLs with coarse engagement.
    pub async fn search(&self, keyword: &str, max_posts: usize) -> Result<Vec<DiscoveredPost>> {
        debug!(keyword, max_posts, "Scraper search");
        let body = serde_json::json!({ "keyword": keyword, "max_posts": max_posts });

        let resp = self
            .http
            .post(self.endpoint("/scrape/search"))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ThreadsError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let text = resp.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}
