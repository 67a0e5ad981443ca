pub mod error;
pub mod types;

pub use error::{GeminiError, Result};

use std::time::Duration;

use base64::Engine;
use tracing::debug;

use types::*;

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub const EMBED_MODEL: &str = "models/text-embedding-004";
pub const EMBED_DIM: usize = 768;
const GENERATE_MODEL: &str = "models/gemini-2.0-flash";

pub struct GeminiClient {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
    generate_model: String,
}

impl GeminiClient {
    pub fn new(api_key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            api_key: api_key.to_string(),
            http,
            base_url: GEMINI_API_URL.to_string(),
            generate_model: GENERATE_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_generate_model(mut self, model: &str) -> Self {
        self.generate_model = model.to_string();
        self
    }

    fn endpoint(&self, model: &str, verb: &str) -> String {
        format!(
            "{}/{}:{}?key={}",
            self.base_url, model, verb, self.api_key
        )
    }

    /// Embed a single text. Hard-fails on dimension mismatch: a wrong-dim
    /// registry write would silently poison vector search.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbedContentRequest {
            model: EMBED_MODEL.to_string(),
            content: Content {
                parts: vec![Part::text(text)],
            },
        };

        let response = self
            .http
            .post(self.endpoint(EMBED_MODEL, "embedContent"))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(GeminiError::Api { status, message });
        }

        let body: EmbedContentResponse = response.json().await?;
        let values = body.embedding.values;
        if values.is_empty() {
            return Err(GeminiError::MissingEmbedding);
        }
        if values.len() != EMBED_DIM {
            return Err(GeminiError::DimensionMismatch {
                expected: EMBED_DIM,
                got: values.len(),
            });
        }

        debug!(model = EMBED_MODEL, dim = values.len(), "Embedding ready");
        Ok(values)
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = BatchEmbedContentsRequest {
            requests: texts
                .iter()
                .map(|t| EmbedContentRequest {
                    model: EMBED_MODEL.to_string(),
                    content: Content {
                        parts: vec![Part::text(t.as_str())],
                    },
                })
                .collect(),
        };

        let response = self
            .http
            .post(self.endpoint(EMBED_MODEL, "batchEmbedContents"))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(GeminiError::Api { status, message });
        }

        let body: BatchEmbedContentsResponse = response.json().await?;
        let mut out = Vec::with_capacity(body.embeddings.len());
        for e in body.embeddings {
            if e.values.len() != EMBED_DIM {
                return Err(GeminiError::DimensionMismatch {
                    expected: EMBED_DIM,
                    got: e.values.len(),
                });
            }
            out.push(e.values);
        }
        Ok(out)
    }

    /// Plain text generation.
    pub async fn generate(&self, prompt: &str, temperature: f32) -> Result<String> {
        self.generate_parts(vec![Part::text(prompt)], temperature, None)
            .await
    }

    /// Generation constrained to a JSON response, parsed before returning.
    pub async fn generate_json(&self, prompt: &str, temperature: f32) -> Result<serde_json::Value> {
        let text = self
            .generate_parts(
                vec![Part::text(prompt)],
                temperature,
                Some("application/json".to_string()),
            )
            .await?;
        Ok(serde_json::from_str(strip_code_fences(&text))?)
    }

    /// JSON generation over a prompt plus one inline image.
    pub async fn generate_json_with_image(
        &self,
        prompt: &str,
        mime_type: &str,
        image_bytes: &[u8],
    ) -> Result<serde_json::Value> {
        let data = base64::engine::general_purpose::STANDARD.encode(image_bytes);
        let text = self
            .generate_parts(
                vec![Part::text(prompt), Part::inline(mime_type, data)],
                0.0,
                Some("application/json".to_string()),
            )
            .await?;
        Ok(serde_json::from_str(strip_code_fences(&text))?)
    }

    async fn generate_parts(
        &self,
        parts: Vec<Part>,
        temperature: f32,
        response_mime_type: Option<String>,
    ) -> Result<String> {
        let request = GenerateContentRequest {
            contents: vec![Content { parts }],
            generation_config: Some(GenerationConfig {
                temperature: Some(temperature),
                response_mime_type,
            }),
        };

        debug!(model = %self.generate_model, "Gemini generate request");

        let response = self
            .http
            .post(self.endpoint(&self.generate_model, "generateContent"))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(GeminiError::Api { status, message });
        }

        let body: GenerateContentResponse = response.json().await?;
        let text: String = body
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or(GeminiError::EmptyResponse)?;

        if text.is_empty() {
            return Err(GeminiError::EmptyResponse);
        }
        Ok(text)
    }
}

/// Models occasionally wrap JSON in markdown fences despite the mime hint.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n[]\n```"), "[]");
    }

    #[test]
    fn rate_limit_detection() {
        let e = GeminiError::Api {
            status: 429,
            message: "quota".to_string(),
        };
        assert!(e.is_rate_limit());
        let e = GeminiError::Api {
            status: 503,
            message: "The model is overloaded".to_string(),
        };
        assert!(e.is_rate_limit());
        assert!(!GeminiError::EmptyResponse.is_rate_limit());
    }
}
