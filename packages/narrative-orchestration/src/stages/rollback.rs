//! Reverts a chapter to a prior rewrite-history entry: the named one, or
//! the newest recorded entry when none is named.

use narrative_storage::repository::chapters::SummaryPolicy;
use narrative_storage::repository::ChapterRepository;
use narrative_storage::{Database, RewriteHistoryEntry};
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::stages::rewrite::RewriteService;

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub chapter_id: i64,
    pub history_id: String,
    pub rolled_back_content: String,
    pub saved: bool,
}

#[derive(Clone)]
pub struct RollbackService {
    db: Database,
    rewrite_service: RewriteService,
}

impl RollbackService {
    pub fn new(db: Database, rewrite_service: RewriteService) -> Self {
        Self { db, rewrite_service }
    }

    /// Tolerates malformed lines in the history file by skipping them — the
    /// file is append-only and a torn write should never break every later
    /// rollback.
    fn read_history(&self, chapter_id: i64) -> Result<Vec<RewriteHistoryEntry>> {
        let path = self.rewrite_service.history_path(chapter_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    pub async fn rollback(&self, chapter_id: i64, history_id: Option<&str>, save: bool) -> Result<RollbackOutcome> {
        let history = self.read_history(chapter_id)?;

        let entry = match history_id {
            Some(id) => history
                .into_iter()
                .find(|e| e.history_id == id)
                .ok_or_else(|| EngineError::not_found("rewrite_history_entry", id))?,
            None => history
                .into_iter()
                .last()
                .ok_or_else(|| EngineError::insufficient_data(format!("chapter {chapter_id} has no rewrite history"), "rewrite_history"))?,
        };

        if entry.original_content.is_empty() {
            return Err(EngineError::invalid_format("rewrite history entry has no original content to restore"));
        }

        if save {
            let chapters = ChapterRepository::new(&self.db.pool);
            chapters.set_content(chapter_id, &entry.original_content, SummaryPolicy::Invalidate).await?;
        }

        Ok(RollbackOutcome {
            chapter_id,
            history_id: entry.history_id,
            rolled_back_content: entry.original_content,
            saved: save,
        })
    }
}

#[cfg(test)]
mod tests {
    use narrative_storage::db::connect;
    use narrative_storage::repository::{ProjectRepository, VolumeRepository};

    use super::*;

    async fn setup() -> (Database, i64, tempfile::TempDir) {
        let db = connect("sqlite::memory:", 1).await.unwrap();
        let project = ProjectRepository::new(&db.pool).create("T", None, None).await.unwrap();
        let volume = VolumeRepository::new(&db.pool).create(project.id, "V1", 1, None).await.unwrap();
        let chapter = ChapterRepository::new(&db.pool).create(volume.id, "C1", 1, "current text", "[]", "[]").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        (db, chapter.id, dir)
    }

    fn write_history(dir: &std::path::Path, chapter_id: i64, entries: &[RewriteHistoryEntry]) {
        let path = dir.join(format!("chapter_{chapter_id}_rewrite_history.jsonl"));
        let body: String = entries.iter().map(|e| format!("{}\n", serde_json::to_string(e).unwrap())).collect();
        std::fs::write(path, body).unwrap();
    }

    fn entry(history_id: &str, chapter_id: i64, original: &str, new: &str) -> RewriteHistoryEntry {
        RewriteHistoryEntry {
            history_id: history_id.to_string(),
            timestamp: chrono::Utc::now(),
            chapter_id,
            chapter_title: "C1".to_string(),
            instruction: "make it punchier".to_string(),
            rewrite_mode: "style".to_string(),
            scope: "chapter".to_string(),
            original_content: original.to_string(),
            new_content: new.to_string(),
        }
    }

    #[tokio::test]
    async fn rolls_back_to_a_named_entry_and_saves() {
        let (db, chapter_id, dir) = setup().await;
        write_history(
            dir.path(),
            chapter_id,
            &[entry("a", chapter_id, "original one", "new one"), entry("b", chapter_id, "original two", "new two")],
        );
        let service = RollbackService::new(db.clone(), RewriteService::new(db.clone(), dir.path()));

        let outcome = service.rollback(chapter_id, Some("a"), true).await.unwrap();
        assert_eq!(outcome.rolled_back_content, "original one");

        let reloaded = ChapterRepository::new(&db.pool).get(chapter_id).await.unwrap();
        assert_eq!(reloaded.content, "original one");
    }

    #[tokio::test]
    async fn defaults_to_the_newest_entry_when_unnamed() {
        let (db, chapter_id, dir) = setup().await;
        write_history(
            dir.path(),
            chapter_id,
            &[entry("a", chapter_id, "original one", "new one"), entry("b", chapter_id, "original two", "new two")],
        );
        let service = RollbackService::new(db.clone(), RewriteService::new(db.clone(), dir.path()));

        let outcome = service.rollback(chapter_id, None, false).await.unwrap();
        assert_eq!(outcome.history_id, "b");
        assert_eq!(outcome.rolled_back_content, "original two");
    }

    #[tokio::test]
    async fn unknown_history_id_is_an_error() {
        let (db, chapter_id, dir) = setup().await;
        write_history(dir.path(), chapter_id, &[entry("a", chapter_id, "x", "y")]);
        let service = RollbackService::new(db.clone(), RewriteService::new(db.clone(), dir.path()));

        let err = service.rollback(chapter_id, Some("missing"), false).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn no_history_file_is_insufficient_data() {
        let (db, chapter_id, dir) = setup().await;
        let service = RollbackService::new(db.clone(), RewriteService::new(db.clone(), dir.path()));

        let err = service.rollback(chapter_id, None, false).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }
}
