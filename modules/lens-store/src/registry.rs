//! narrative_phenomena operations: vector match, registry upsert, occurrence
//! accounting, and the library read surface.

use pgvector::Vector;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::rows::{PhenomenonMatch, PhenomenonRow};
use crate::Store;

pub const EMBED_DIM: usize = 768;

impl Store {
    /// Top-K cosine match through the named store function. A wrong-dim
    /// query embedding is an operator error surfaced before the call.
    pub async fn match_phenomena(
        &self,
        embedding: &[f32],
        threshold: f64,
        topk: i64,
    ) -> Result<Vec<PhenomenonMatch>> {
        if embedding.len() != EMBED_DIM {
            return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                "registry embedding dim mismatch: expected {EMBED_DIM}, got {}",
                embedding.len()
            ))));
        }

        let pool = self.pool.clone();
        let vector = Vector::from(embedding.to_vec());
        self.submit("match_phenomena_v768", move || {
            let pool = pool.clone();
            let vector = vector.clone();
            async move {
                sqlx::query_as::<_, PhenomenonMatch>(
                    "SELECT * FROM match_phenomena_v768($1, $2, $3)",
                )
                .bind(vector)
                .bind(threshold)
                .bind(topk)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    /// Upsert a registry row. Status never moves backward off `active`, and
    /// the first minted embedding/name stick.
    pub async fn upsert_phenomenon(
        &self,
        id: Uuid,
        canonical_name: &str,
        description: &str,
        status: &str,
        embedding: &[f32],
        minted_by_case_id: &str,
    ) -> Result<()> {
        if embedding.len() != EMBED_DIM {
            return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                "registry embedding dim mismatch: expected {EMBED_DIM}, got {}",
                embedding.len()
            ))));
        }

        let pool = self.pool.clone();
        let canonical_name = canonical_name.to_string();
        let description = description.to_string();
        let status = status.to_string();
        let minted_by_case_id = minted_by_case_id.to_string();
        let vector = Vector::from(embedding.to_vec());

        self.submit("upsert_phenomenon", move || {
            let pool = pool.clone();
            let canonical_name = canonical_name.clone();
            let description = description.clone();
            let status = status.clone();
            let minted_by_case_id = minted_by_case_id.clone();
            let vector = vector.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO narrative_phenomena
                        (id, canonical_name, description, status, embedding_v768,
                         minted_by_case_id)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (id) DO UPDATE
                    SET canonical_name = COALESCE(narrative_phenomena.canonical_name, EXCLUDED.canonical_name),
                        description = COALESCE(narrative_phenomena.description, EXCLUDED.description),
                        status = CASE
                            WHEN narrative_phenomena.status = 'active' THEN narrative_phenomena.status
                            ELSE EXCLUDED.status
                        END,
                        embedding_v768 = COALESCE(narrative_phenomena.embedding_v768, EXCLUDED.embedding_v768),
                        updated_at = now()
                    "#,
                )
                .bind(id)
                .bind(&canonical_name)
                .bind(&description)
                .bind(&status)
                .bind(vector)
                .bind(&minted_by_case_id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Atomic occurrence bump. A missing function is an operator error; the
    /// caller must hard-fail, never silently drift.
    pub async fn increment_occurrence(&self, phenomenon_id: Uuid) -> Result<()> {
        let pool = self.pool.clone();
        self.submit("increment_occurrence", move || {
            let pool = pool.clone();
            async move {
                sqlx::query("SELECT increment_occurrence($1)")
                    .bind(phenomenon_id)
                    .execute(&pool)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    pub async fn get_phenomenon(&self, id: Uuid) -> Result<Option<PhenomenonRow>> {
        let pool = self.pool.clone();
        let row = self
            .submit_degraded("get_phenomenon", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query_as::<_, PhenomenonRow>(
                        r#"
                        SELECT id, canonical_name, description, status,
                               occurrence_count, minted_by_case_id, created_at
                        FROM narrative_phenomena
                        WHERE id = $1
                        "#,
                    )
                    .bind(id)
                    .fetch_optional(&pool)
                    .await
                }
            })
            .await?;
        Ok(row.flatten())
    }

    pub async fn list_phenomena(
        &self,
        status: Option<&str>,
        q: Option<&str>,
        limit: i64,
    ) -> Result<Option<Vec<PhenomenonRow>>> {
        let pool = self.pool.clone();
        let status = status.map(String::from);
        let q = q.map(String::from);

        self.submit_degraded("list_phenomena", move || {
            let pool = pool.clone();
            let status = status.clone();
            let q = q.clone();
            async move {
                sqlx::query_as::<_, PhenomenonRow>(
                    r#"
                    SELECT id, canonical_name, description, status,
                           occurrence_count, minted_by_case_id, created_at
                    FROM narrative_phenomena
                    WHERE ($1::text IS NULL OR status = $1)
                      AND ($2::text IS NULL
                           OR canonical_name ILIKE '%' || $2 || '%'
                           OR description ILIKE '%' || $2 || '%')
                    ORDER BY occurrence_count DESC, created_at DESC
                    LIMIT $3
                    "#,
                )
                .bind(&status)
                .bind(&q)
                .bind(limit)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    /// `provisional -> active` promotion. Returns false when the row is not
    /// promotable (caller maps that to a state conflict).
    pub async fn promote_phenomenon(&self, id: Uuid) -> Result<bool> {
        let pool = self.pool.clone();
        let affected = self
            .submit("promote_phenomenon", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query(
                        r#"
                        UPDATE narrative_phenomena
                        SET status = 'active', updated_at = now()
                        WHERE id = $1 AND status = 'provisional'
                        "#,
                    )
                    .bind(id)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
                }
            })
            .await?;
        Ok(affected > 0)
    }

    /// Per-phenomenon aggregates from the posts table, for registry
    /// reconciliation: (phenomenon_id, post_count, latest_case_id).
    pub async fn phenomenon_refs_for_sync(&self) -> Result<Vec<(String, i64, Option<String>)>> {
        let pool = self.pool.clone();
        let rows = self
            .submit_degraded("phenomenon_refs_for_sync", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query_as::<_, (String, i64, Option<String>)>(
                        r#"
                        SELECT p.phenomenon_id,
                               count(*) AS total_posts,
                               (SELECT p2.phenomenon_case_id FROM threads_posts p2
                                WHERE p2.phenomenon_id = p.phenomenon_id
                                  AND p2.phenomenon_case_id IS NOT NULL
                                ORDER BY p2.created_at DESC
                                LIMIT 1) AS latest_case_id
                        FROM threads_posts p
                        WHERE p.phenomenon_id IS NOT NULL
                        GROUP BY p.phenomenon_id
                        "#,
                    )
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;
        Ok(rows.unwrap_or_default())
    }

    /// Reconcile one registry row from post-side aggregates. Creates missing
    /// rows as provisional; occurrence_count only ever moves up.
    pub async fn reconcile_phenomenon(
        &self,
        id: Uuid,
        occurrence_count: i64,
        minted_by_case_id: Option<&str>,
    ) -> Result<()> {
        let pool = self.pool.clone();
        let minted_by_case_id = minted_by_case_id.map(String::from);
        self.submit("reconcile_phenomenon", move || {
            let pool = pool.clone();
            let minted_by_case_id = minted_by_case_id.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO narrative_phenomena (id, status, occurrence_count, minted_by_case_id)
                    VALUES ($1, 'provisional', $2, $3)
                    ON CONFLICT (id) DO UPDATE
                    SET occurrence_count = GREATEST(narrative_phenomena.occurrence_count, EXCLUDED.occurrence_count),
                        minted_by_case_id = COALESCE(narrative_phenomena.minted_by_case_id, EXCLUDED.minted_by_case_id),
                        updated_at = now()
                    "#,
                )
                .bind(id)
                .bind(occurrence_count)
                .bind(&minted_by_case_id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Phenomenon ids referenced by posts but missing from the registry
    /// (sync CLI).
    pub async fn unregistered_phenomenon_refs(&self) -> Result<Vec<(String, Option<String>)>> {
        let pool = self.pool.clone();
        let rows = self
            .submit_degraded("unregistered_phenomenon_refs", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query_as::<_, (String, Option<String>)>(
                        r#"
                        SELECT DISTINCT p.phenomenon_id, p.phenomenon_case_id
                        FROM threads_posts p
                        LEFT JOIN narrative_phenomena n ON n.id::text = p.phenomenon_id
                        WHERE p.phenomenon_id IS NOT NULL AND n.id IS NULL
                        "#,
                    )
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;
        Ok(rows.unwrap_or_default())
    }
}
