pub mod config;
pub mod ids;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use traits::{Analyst, KeywordDiscoverer, PostFetcher, TextEmbedder, VisionAnalyzer};
pub use types::*;
