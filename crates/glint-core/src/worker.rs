//! The job loop: lease, enrich, commit, classify failures.
//!
//! One job at a time per process; horizontal scale is more processes on
//! the same database. Each poll cycle opens a fresh connection so no
//! transaction can accidentally straddle polls.

use std::time::Duration;

use rusqlite::Connection;

use crate::alias;
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::error::{ProviderError, WorkerError};
use crate::provider::{self, VlmProvider};
use crate::tags::TagDiscovery;
use crate::types::{AssetStatus, CaptionLength, Job};

pub struct Worker {
    config: Config,
    provider: Box<dyn VlmProvider>,
}

impl Worker {
    /// Build a worker with the provider selected by the configuration.
    pub fn new(config: Config) -> Result<Self, ProviderError> {
        let provider = provider::create_provider(&config)?;
        Ok(Self { config, provider })
    }

    /// Build a worker around an existing provider (embedding, tests).
    pub fn with_provider(config: Config, provider: Box<dyn VlmProvider>) -> Self {
        Self { config, provider }
    }

    /// Poll the queue forever. Returns only on an error outside the
    /// per-job body, e.g. the database cannot be opened.
    pub async fn run(&self) -> Result<(), WorkerError> {
        tracing::info!(
            db = %self.config.db_path.display(),
            provider = self.provider.name(),
            model = self.provider.model_version(),
            "worker started"
        );
        loop {
            let mut conn = db::open(&self.config.db_path)?;
            let leased = self.run_cycle(&mut conn).await?;
            // Close errors are not worth dying for; drop swallows them.
            drop(conn);
            if !leased {
                tokio::time::sleep(Duration::from_secs_f64(self.config.poll_seconds)).await;
            }
        }
    }

    /// One poll cycle: lease a job and run it through the pipeline.
    /// Returns false when the queue was empty.
    async fn run_cycle(&self, conn: &mut Connection) -> Result<bool, WorkerError> {
        let Some(job) = db::fetch_next_job(conn)? else {
            return Ok(false);
        };
        tracing::info!(asset = %job.asset_id, file = %job.original_name, "processing");

        let tx = conn.transaction()?;
        db::set_status(&tx, &job.asset_id, AssetStatus::Processing)?;
        tx.commit()?;

        match self.enrich(conn, &job).await {
            Ok(()) => {
                tracing::info!(asset = %job.asset_id, "done");
            }
            Err(err) => {
                let transient =
                    matches!(&err, WorkerError::Provider(p) if p.is_transient());
                let status = if transient {
                    AssetStatus::Pending
                } else {
                    AssetStatus::Failed
                };
                if let Err(cleanup_err) = self.clear_results(conn, &job, status) {
                    tracing::error!(
                        asset = %job.asset_id,
                        error = %cleanup_err,
                        "failed to record job outcome"
                    );
                }
                if transient {
                    tracing::warn!(asset = %job.asset_id, error = %err, "transient failure, re-queued");
                    tokio::time::sleep(Duration::from_secs_f64(
                        self.config.retry_backoff_seconds,
                    ))
                    .await;
                } else {
                    tracing::error!(asset = %job.asset_id, error = %err, "enrichment failed");
                }
            }
        }
        Ok(true)
    }

    /// The enrichment body. Everything that escapes here goes through the
    /// transient-vs-fatal classifier in `run_cycle`.
    async fn enrich(&self, conn: &mut Connection, job: &Job) -> Result<(), WorkerError> {
        let image_ref = job.storage_path.as_str();

        let caption = self.caption_with_retry(image_ref).await?;

        let discovery = TagDiscovery::new(
            self.provider.as_ref(),
            self.config.tags_mode,
            self.config.max_tags,
        );
        let discovered = discovery.discover(image_ref, &caption).await;
        let kept_tags: Vec<String> = discovered.iter().map(|t| t.tag.clone()).collect();

        let embedding_blob =
            embedding::embed_caption(&self.config.model_dir, &self.config.embedding_model, &caption);

        // The alias title may need a VLM round-trip, so resolve it before
        // the write transaction opens.
        let pretty = if self.config.generate_names {
            let title =
                alias::resolve_title(self.provider.as_ref(), job, &caption, self.config.name_mode)
                    .await;
            alias::pretty_name(&title, job)
        } else {
            None
        };

        let tx = conn.transaction()?;
        db::write_results(
            &tx,
            &job.asset_id,
            &caption,
            &kept_tags,
            AssetStatus::Done,
            self.provider.model_version(),
        )?;
        if let Some(pretty) = &pretty {
            db::rename_asset(&tx, &job.asset_id, pretty)?;
        }
        if let Some(blob) = &embedding_blob {
            db::upsert_embedding_row(&tx, &job.asset_id, &blob.model, blob.dim, &blob.bytes)?;
        }
        for entry in &discovered {
            let bbox_json = serde_json::to_string(&entry.detection).ok();
            db::upsert_segment_row(
                &tx,
                &job.asset_id,
                &entry.tag,
                entry.svg.as_deref(),
                bbox_json.as_deref(),
            )?;
        }
        db::delete_segments_not_in(&tx, &job.asset_id, &kept_tags)?;
        db::update_search_index(&tx, &job.asset_id)?;
        tx.commit()?;

        // Filesystem work happens after the commit and is best-effort.
        if self.config.create_named_alias {
            if let Some(pretty) = &pretty {
                let sha8: String = job.sha256.chars().take(8).collect();
                let ext = alias::pick_extension(job);
                alias::install_alias(&job.storage_path, pretty, &sha8, &ext);
            }
        }

        Ok(())
    }

    /// Caption the image; a `long` request that times out gets one retry
    /// at `normal` length before the error propagates.
    async fn caption_with_retry(&self, image_ref: &str) -> Result<String, ProviderError> {
        let length = self.config.caption_length;
        match self.provider.caption(image_ref, length).await {
            Ok(caption) => Ok(caption),
            Err(err) if length == CaptionLength::Long && mentions_timeout(&err) => {
                tracing::debug!(error = %err, "long caption timed out, retrying at normal length");
                self.provider.caption(image_ref, CaptionLength::Normal).await
            }
            Err(err) => Err(err),
        }
    }

    /// Shared failure commit: clear caption and tags, drop every segment
    /// row, rebuild the search index so no stale UI state survives.
    fn clear_results(
        &self,
        conn: &mut Connection,
        job: &Job,
        status: AssetStatus,
    ) -> Result<(), WorkerError> {
        let tx = conn.transaction()?;
        db::write_results(
            &tx,
            &job.asset_id,
            "",
            &[],
            status,
            self.provider.model_version(),
        )?;
        db::delete_segments_not_in(&tx, &job.asset_id, &[])?;
        db::update_search_index(&tx, &job.asset_id)?;
        tx.commit()?;
        Ok(())
    }
}

fn mentions_timeout(err: &ProviderError) -> bool {
    let msg = err.message.to_lowercase();
    msg.contains("timeout") || msg.contains("timed out")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{create_upstream_schema, seed_asset};
    use crate::types::TagsMode;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fully scripted provider for end-to-end scenarios.
    struct ScriptedProvider {
        caption: Result<String, ProviderError>,
        query_answer: Option<String>,
        detections: HashMap<String, Value>,
        segment_unsupported: bool,
        caption_calls: AtomicUsize,
        segment_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(caption: &str) -> Self {
            Self {
                caption: Ok(caption.to_string()),
                query_answer: None,
                detections: HashMap::new(),
                segment_unsupported: false,
                caption_calls: AtomicUsize::new(0),
                segment_calls: AtomicUsize::new(0),
            }
        }

        fn failing(caption_error: ProviderError) -> Self {
            Self {
                caption: Err(caption_error),
                ..Self::new("")
            }
        }

        fn with_query(mut self, answer: &str) -> Self {
            self.query_answer = Some(answer.to_string());
            self
        }

        fn with_boxes(mut self, object: &str) -> Self {
            self.detections.insert(
                object.to_string(),
                json!({"objects": [{"x_min": 0.1, "y_min": 0.1, "x_max": 0.6, "y_max": 0.6}]}),
            );
            self
        }
    }

    #[async_trait]
    impl VlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model_version(&self) -> &str {
            "scripted-v1"
        }

        async fn caption(
            &self,
            _image_ref: &str,
            _length: CaptionLength,
        ) -> Result<String, ProviderError> {
            self.caption_calls.fetch_add(1, Ordering::SeqCst);
            self.caption.clone()
        }

        async fn detect(&self, _image_ref: &str, object: &str) -> Result<Value, ProviderError> {
            Ok(self
                .detections
                .get(object)
                .cloned()
                .unwrap_or_else(|| json!({"objects": []})))
        }

        async fn segment(&self, _image_ref: &str, object: &str) -> Result<Value, ProviderError> {
            self.segment_calls.fetch_add(1, Ordering::SeqCst);
            if self.segment_unsupported {
                return Err(ProviderError::new(
                    "segment is not supported by this provider",
                ));
            }
            Ok(json!({
                "path": format!("M0 0 L1 1 {object}"),
                "bbox": {"x_min": 0.0, "y_min": 0.0, "x_max": 1.0, "y_max": 1.0},
            }))
        }

        async fn query(&self, _image_ref: &str, _question: &str) -> Result<String, ProviderError> {
            match &self.query_answer {
                Some(answer) => Ok(answer.clone()),
                None => Err(ProviderError::new("query failed")),
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
    }

    fn fixture(max_tags: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            db_path: dir.path().join("test.sqlite3"),
            // The model dir is empty on purpose: embeddings stay disabled
            // and must not block a done transition.
            model_dir: dir.path().join("models"),
            max_tags,
            tags_mode: TagsMode::Hybrid,
            retry_backoff_seconds: 0.0,
            poll_seconds: 0.0,
            // Alias side effects get their own test with a real on-disk
            // layout; everything else opts out so nothing touches the
            // seeded storage paths.
            generate_names: false,
            ..Config::default()
        };
        Fixture { _dir: dir, config }
    }

    fn worker(fixture: &Fixture, provider: ScriptedProvider) -> Worker {
        Worker::with_provider(fixture.config.clone(), Box::new(provider))
    }

    fn open_seeded(config: &Config, status: &str) -> Connection {
        let conn = db::open(&config.db_path).unwrap();
        create_upstream_schema(&conn);
        seed_asset(&conn, "a1", "image/jpeg", status, 10);
        conn
    }

    fn asset_ai_row(conn: &Connection) -> (String, String, String) {
        conn.query_row(
            "SELECT status, caption, tags_json FROM asset_ai WHERE asset_id = 'a1'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap()
    }

    fn segment_tags(conn: &Connection) -> Vec<(String, Option<String>)> {
        let mut stmt = conn
            .prepare("SELECT tag, svg FROM asset_segments WHERE asset_id = 'a1' ORDER BY tag")
            .unwrap();
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .map(Result::unwrap)
            .collect()
    }

    #[tokio::test]
    async fn test_happy_path() {
        let fx = fixture(2);
        let provider = ScriptedProvider::new("A dog on a sofa.")
            .with_query(r#"["dog","sofa","window"]"#)
            .with_boxes("dog")
            .with_boxes("sofa");
        let worker = worker(&fx, provider);

        let mut conn = open_seeded(&fx.config, "pending");
        assert!(worker.run_cycle(&mut conn).await.unwrap());

        let (status, caption, tags_json) = asset_ai_row(&conn);
        assert_eq!(status, "done");
        assert_eq!(caption, "A dog on a sofa.");
        assert_eq!(tags_json, r#"["dog","sofa"]"#);

        let segments = segment_tags(&conn);
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|(_, svg)| svg.is_some()));

        // bbox_json carries both the detect boxes and the segment bbox.
        let bbox_json: String = conn
            .query_row(
                "SELECT bbox_json FROM asset_segments WHERE asset_id = 'a1' AND tag = 'dog'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        let payload: Value = serde_json::from_str(&bbox_json).unwrap();
        assert_eq!(payload["tag"], "dog");
        assert_eq!(payload["boxes"].as_array().unwrap().len(), 1);
        assert!(payload["segment_bbox"].is_object());
        assert!(payload["raw"]["objects"].is_array());

        let (search_caption, search_tags): (String, String) = conn
            .query_row(
                "SELECT caption, tags FROM asset_search WHERE asset_id = 'a1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(search_caption, "A dog on a sofa.");
        assert_eq!(search_tags, "dog sofa");

        // Embedder is disabled in tests; done must not require a row.
        let embeddings: i64 = conn
            .query_row("SELECT count(*) FROM asset_embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(embeddings, 0);
    }

    #[tokio::test]
    async fn test_transient_timeout_requeues() {
        let fx = fixture(2);
        let provider = ScriptedProvider::failing(ProviderError::new(
            r#"station caption error: {"status":"timeout"}"#,
        ));
        let worker = worker(&fx, provider);

        let mut conn = open_seeded(&fx.config, "pending");
        // Leave a stale segment around to prove the cleanup runs.
        db::upsert_segment_row(&conn, "a1", "stale", None, None).unwrap();

        assert!(worker.run_cycle(&mut conn).await.unwrap());

        let (status, caption, tags_json) = asset_ai_row(&conn);
        assert_eq!(status, "pending");
        assert_eq!(caption, "");
        assert_eq!(tags_json, "[]");
        assert!(segment_tags(&conn).is_empty());

        let (search_caption, search_tags): (String, String) = conn
            .query_row(
                "SELECT caption, tags FROM asset_search WHERE asset_id = 'a1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(search_caption, "");
        assert_eq!(search_tags, "");
    }

    #[tokio::test]
    async fn test_fatal_error_marks_failed() {
        let fx = fixture(2);
        let provider = ScriptedProvider::failing(ProviderError::with_status(
            "station caption failed: 500 Internal Server Error",
            500,
        ));
        let worker = worker(&fx, provider);

        let mut conn = open_seeded(&fx.config, "pending");
        assert!(worker.run_cycle(&mut conn).await.unwrap());

        let (status, caption, tags_json) = asset_ai_row(&conn);
        assert_eq!(status, "failed");
        assert_eq!(caption, "");
        assert_eq!(tags_json, "[]");
        assert!(segment_tags(&conn).is_empty());
    }

    #[tokio::test]
    async fn test_segment_unsupported_keeps_tags() {
        let fx = fixture(4);
        let provider = ScriptedProvider {
            segment_unsupported: true,
            ..ScriptedProvider::new("A dog on a sofa.")
                .with_query(r#"["dog","sofa"]"#)
                .with_boxes("dog")
                .with_boxes("sofa")
        };
        let worker = worker(&fx, provider);

        let mut conn = open_seeded(&fx.config, "pending");
        assert!(worker.run_cycle(&mut conn).await.unwrap());

        let (status, _, tags_json) = asset_ai_row(&conn);
        assert_eq!(status, "done");
        assert_eq!(tags_json, r#"["dog","sofa"]"#);

        let segments = segment_tags(&conn);
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|(_, svg)| svg.is_none()));
    }

    #[tokio::test]
    async fn test_crash_recovery_releases_processing_row() {
        let fx = fixture(2);
        let provider = ScriptedProvider::new("A lamp.").with_boxes("lamp");
        let worker = worker(&fx, provider);

        // Simulate a crashed worker: the row is already in processing.
        let mut conn = open_seeded(&fx.config, "processing");
        assert!(worker.run_cycle(&mut conn).await.unwrap());

        let (status, caption, _) = asset_ai_row(&conn);
        assert_eq!(status, "done");
        assert_eq!(caption, "A lamp.");
    }

    #[tokio::test]
    async fn test_empty_queue_reports_idle() {
        let fx = fixture(2);
        let worker = worker(&fx, ScriptedProvider::new("unused"));
        let mut conn = db::open(&fx.config.db_path).unwrap();
        create_upstream_schema(&conn);
        assert!(!worker.run_cycle(&mut conn).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_filename_alias_side_effects() {
        let fx = fixture(2);
        let mut config = fx.config.clone();
        config.generate_names = true;
        let provider = ScriptedProvider::new("A cat playing with yarn.").with_boxes("cat");
        let worker = Worker::with_provider(config, Box::new(provider));

        let conn = db::open(&fx.config.db_path).unwrap();
        create_upstream_schema(&conn);

        // Real on-disk layout: <project>/assets/<sha>.jpg
        let project_root = fx._dir.path().join("project-1");
        let assets_dir = project_root.join("assets");
        std::fs::create_dir_all(&assets_dir).unwrap();
        let storage = assets_dir.join("abcdef12.jpg");
        std::fs::write(&storage, b"jpegdata").unwrap();

        conn.execute(
            "INSERT INTO assets (id, project_id, original_name, mime_type, storage_path, storage_url, sha256)
             VALUES ('a1', 'project-1', 'upload.jpg', 'image/jpeg', ?1, NULL, 'abcdef1234567890')",
            [storage.to_str().unwrap()],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO asset_ai (asset_id, status) VALUES ('a1', 'pending')",
            [],
        )
        .unwrap();

        // A stale alias from a previous enrichment of the same asset.
        let named_dir = project_root.join("named");
        std::fs::create_dir_all(&named_dir).unwrap();
        let stale = named_dir.join("old-caption--abcdef12.jpg");
        std::os::unix::fs::symlink(&storage, &stale).unwrap();

        let mut conn = conn;
        assert!(worker.run_cycle(&mut conn).await.unwrap());

        let display_name: String = conn
            .query_row("SELECT original_name FROM assets WHERE id = 'a1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(display_name, "a-cat-playing-with-yarn--abcdef12.jpg");

        let link = named_dir.join("a-cat-playing-with-yarn--abcdef12.jpg");
        assert_eq!(std::fs::read_link(&link).unwrap(), storage);
        assert!(!stale.exists());

        // The search row reflects the renamed asset within the same commit.
        let search_name: String = conn
            .query_row(
                "SELECT original_name FROM asset_search WHERE asset_id = 'a1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(search_name, "a-cat-playing-with-yarn--abcdef12.jpg");
    }

    #[tokio::test]
    async fn test_generate_names_off_keeps_original_name() {
        let fx = fixture(2);
        let mut config = fx.config.clone();
        config.generate_names = false;
        let provider = ScriptedProvider::new("A cat.").with_boxes("cat");
        let worker = Worker::with_provider(config, Box::new(provider));

        let mut conn = open_seeded(&fx.config, "pending");
        assert!(worker.run_cycle(&mut conn).await.unwrap());

        let name: String = conn
            .query_row("SELECT original_name FROM assets WHERE id = 'a1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(name, "a1.jpg");
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let fx = fixture(2);
        let provider = ScriptedProvider::new("A dog on a sofa.")
            .with_query(r#"["dog","sofa"]"#)
            .with_boxes("dog")
            .with_boxes("sofa");
        let worker = worker(&fx, provider);

        let mut conn = open_seeded(&fx.config, "pending");
        assert!(worker.run_cycle(&mut conn).await.unwrap());
        let first = asset_ai_row(&conn);

        // Force the asset back through the pipeline.
        db::set_status(&conn, "a1", AssetStatus::Pending).unwrap();
        assert!(worker.run_cycle(&mut conn).await.unwrap());
        let second = asset_ai_row(&conn);

        assert_eq!(first, second);
        assert_eq!(segment_tags(&conn).len(), 2);
        let search_rows: i64 = conn
            .query_row("SELECT count(*) FROM asset_search", [], |r| r.get(0))
            .unwrap();
        assert_eq!(search_rows, 1);
    }

    #[tokio::test]
    async fn test_long_caption_retries_at_normal() {
        struct LongTimesOut {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl VlmProvider for LongTimesOut {
            fn name(&self) -> &str {
                "long-times-out"
            }
            fn model_version(&self) -> &str {
                "test"
            }
            async fn caption(
                &self,
                _image_ref: &str,
                length: CaptionLength,
            ) -> Result<String, ProviderError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                match length {
                    CaptionLength::Long => {
                        Err(ProviderError::new("station caption error: timed out"))
                    }
                    _ => Ok("A short caption.".to_string()),
                }
            }
            async fn detect(&self, _: &str, _: &str) -> Result<Value, ProviderError> {
                Ok(json!({"objects": []}))
            }
            async fn segment(&self, _: &str, _: &str) -> Result<Value, ProviderError> {
                Ok(json!({}))
            }
            async fn query(&self, _: &str, _: &str) -> Result<String, ProviderError> {
                Err(ProviderError::new("query failed"))
            }
        }

        let fx = fixture(2);
        let mut config = fx.config.clone();
        config.caption_length = CaptionLength::Long;
        let provider = LongTimesOut {
            calls: AtomicUsize::new(0),
        };
        let worker = Worker::with_provider(config, Box::new(provider));

        let mut conn = open_seeded(&fx.config, "pending");
        assert!(worker.run_cycle(&mut conn).await.unwrap());

        let (status, caption, _) = asset_ai_row(&conn);
        assert_eq!(status, "done");
        assert_eq!(caption, "A short caption.");
    }

    #[test]
    fn test_mentions_timeout() {
        assert!(mentions_timeout(&ProviderError::new("request timed out")));
        assert!(mentions_timeout(&ProviderError::new(
            r#"{"status":"timeout"}"#
        )));
        assert!(!mentions_timeout(&ProviderError::new("queue is full")));
    }
}
