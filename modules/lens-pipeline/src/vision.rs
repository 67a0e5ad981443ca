//! Vision stage driver: gate, two-stage worker, first-image enrichment, and
//! the vision metadata write-back. Callers treat any error here as soft.

use serde_json::Value;
use tracing::info;

use lens_analysis::{GateMetrics, VisionGate};
use lens_common::{FetchedPost, VisionAnalyzer, VisionMode, VisionStageCap};
use lens_store::Store;

/// Run the vision stage for one post. Returns the stage that actually ran
/// (`none`, `v1`, or `v2`).
pub async fn run_vision_stage(
    store: &Store,
    vision: &dyn VisionAnalyzer,
    post_id: i64,
    fetched: &mut FetchedPost,
    vision_mode: &VisionMode,
    stage_cap: &VisionStageCap,
) -> anyhow::Result<String> {
    let post_id_str = post_id.to_string();
    let post_text = if fetched.post_text.is_empty() {
        &fetched.post_text_raw
    } else {
        &fetched.post_text
    };

    let gate = VisionGate::new();
    let decision = gate.evaluate(
        &post_id_str,
        fetched.images.len(),
        post_text,
        &fetched.comments,
        vision_mode,
        &GateMetrics {
            view_count: fetched.metrics.views,
            like_count: fetched.metrics.likes,
            reply_count: fetched.metrics.reply_count,
            metrics_reliable: true,
        },
        None,
        &[],
    );

    if !decision.run_v1 {
        store
            .update_vision_meta(post_id, decision.to_db_fields(vision_mode, "none"), None)
            .await?;
        return Ok("none".to_string());
    }

    let Some(first) = fetched.images.first().cloned() else {
        store
            .update_vision_meta(post_id, decision.to_db_fields(vision_mode, "none"), None)
            .await?;
        return Ok("none".to_string());
    };
    let src = first.remote_src().to_string();
    if !src.starts_with("http") {
        store
            .update_vision_meta(post_id, decision.to_db_fields(vision_mode, "none"), None)
            .await?;
        return Ok("none".to_string());
    }

    let v1 = vision.run_v1(&src).await?;
    let mut stage_ran = "v1";

    let should_v2 = match stage_cap {
        VisionStageCap::V1 => false,
        VisionStageCap::V2 | VisionStageCap::Auto => v1.warrants_v2(),
        VisionStageCap::Other(_) => false,
    };
    let v2 = if should_v2 {
        let v2 = vision.run_v2(&src).await?;
        stage_ran = "v2";
        Some(v2)
    } else {
        None
    };

    // Enrich the first image record in place; the rest pass through.
    let enriched = &mut fetched.images[0];
    enriched.scene_label = v2
        .as_ref()
        .and_then(|v| v.scene_label.clone())
        .or_else(|| v1.category.clone())
        .or_else(|| enriched.scene_label.clone());
    if let Some(ref v2) = v2 {
        enriched.full_text = v2.extracted_text.clone().or(Some(String::new()));
        enriched.context_desc = v2.context_desc.clone().or(Some(String::new()));
        enriched.visual_rhetoric = v2.visual_rhetoric.clone().or(Some(String::new()));
    } else {
        enriched.context_desc = v1.notes.clone().or(Some(String::new()));
    }

    let mut fields = decision.to_db_fields(vision_mode, stage_ran);
    fields["vision_v1"] = serde_json::to_value(&v1)?;
    fields["vision_v2"] = match &v2 {
        Some(v2) => serde_json::to_value(v2)?,
        None => Value::Null,
    };
    let images = serde_json::to_value(&fetched.images)?;
    store
        .update_vision_meta(post_id, fields, Some(images))
        .await?;

    info!(post_id, stage = stage_ran, "Vision stage completed");
    Ok(stage_ran.to_string())
}
