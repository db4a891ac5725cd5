use chrono::Utc;
use sqlx::SqlitePool;

use crate::domain::Chapter;
use crate::error::{Result, StorageError};

/// Whether a body-overwriting caller wants the cached summary invalidated
/// (the default, per invariant 8) or explicitly reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryPolicy {
    Invalidate,
    ReuseExisting,
}

pub struct ChapterRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ChapterRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        volume_id: i64,
        title: &str,
        order: i64,
        content: &str,
        key_events: &str,
        characters_involved: &str,
    ) -> Result<Chapter> {
        let now = Utc::now();
        let word_count = word_count(content);
        let id = sqlx::query(
            r#"
            INSERT INTO chapters
                (volume_id, title, "order", content, word_count, key_events, characters_involved, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(volume_id)
        .bind(title)
        .bind(order)
        .bind(content)
        .bind(word_count)
        .bind(key_events)
        .bind(characters_involved)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?
        .last_insert_rowid();

        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Chapter> {
        sqlx::query_as::<_, Chapter>("SELECT * FROM chapters WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("chapter", id))
    }

    pub async fn list_for_volume(&self, volume_id: i64) -> Result<Vec<Chapter>> {
        Ok(sqlx::query_as::<_, Chapter>(
            r#"SELECT * FROM chapters WHERE volume_id = ? ORDER BY "order""#,
        )
        .bind(volume_id)
        .fetch_all(self.pool)
        .await?)
    }

    pub async fn list_for_project(&self, project_id: i64) -> Result<Vec<Chapter>> {
        Ok(sqlx::query_as::<_, Chapter>(
            r#"
            SELECT chapters.* FROM chapters
            JOIN volumes ON volumes.id = chapters.volume_id
            WHERE volumes.project_id = ?
            ORDER BY volumes."order", chapters."order"
            "#,
        )
        .bind(project_id)
        .fetch_all(self.pool)
        .await?)
    }

    pub async fn get_by_order(&self, volume_id: i64, n: i64) -> Result<Chapter> {
        sqlx::query_as::<_, Chapter>(r#"SELECT * FROM chapters WHERE volume_id = ? AND "order" = ?"#)
            .bind(volume_id)
            .bind(n)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("chapter", format!("volume={volume_id} order={n}")))
    }

    /// Overwrites `content`, recomputes `word_count`, and invalidates
    /// `summary` unless the caller explicitly asks to reuse the cached value.
    pub async fn set_content(&self, id: i64, content: &str, policy: SummaryPolicy) -> Result<Chapter> {
        let word_count = word_count(content);
        match policy {
            SummaryPolicy::Invalidate => {
                sqlx::query(
                    "UPDATE chapters SET content = ?, word_count = ?, summary = NULL, updated_at = ? WHERE id = ?",
                )
                .bind(content)
                .bind(word_count)
                .bind(Utc::now())
                .bind(id)
                .execute(self.pool)
                .await?;
            }
            SummaryPolicy::ReuseExisting => {
                sqlx::query("UPDATE chapters SET content = ?, word_count = ?, updated_at = ? WHERE id = ?")
                    .bind(content)
                    .bind(word_count)
                    .bind(Utc::now())
                    .bind(id)
                    .execute(self.pool)
                    .await?;
            }
        }
        self.get(id).await
    }

    pub async fn set_summary(&self, id: i64, summary: &str) -> Result<()> {
        sqlx::query("UPDATE chapters SET summary = ?, updated_at = ? WHERE id = ?")
            .bind(summary)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_detail_outline(&self, id: i64, detail_outline: &str) -> Result<()> {
        sqlx::query("UPDATE chapters SET detail_outline = ?, updated_at = ? WHERE id = ?")
            .bind(detail_outline)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_quality_report(&self, id: i64, report_json: &str) -> Result<()> {
        sqlx::query("UPDATE chapters SET quality_report = ?, updated_at = ? WHERE id = ?")
            .bind(report_json)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn search_by_substring(&self, project_id: i64, q: &str) -> Result<Vec<Chapter>> {
        let pattern = format!("%{}%", q.replace('%', "\\%").replace('_', "\\_"));
        Ok(sqlx::query_as::<_, Chapter>(
            r#"
            SELECT chapters.* FROM chapters
            JOIN volumes ON volumes.id = chapters.volume_id
            WHERE volumes.project_id = ? AND chapters.content LIKE ? ESCAPE '\'
            ORDER BY volumes."order", chapters."order"
            "#,
        )
        .bind(project_id)
        .bind(pattern)
        .fetch_all(self.pool)
        .await?)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM chapters WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

/// Character count rather than whitespace-delimited word count: the corpus
/// this engine targets is Chinese-heavy and has no reliable word boundary.
fn word_count(content: &str) -> i64 {
    content.chars().count() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect;
    use crate::repository::{ProjectRepository, VolumeRepository};

    async fn setup() -> (crate::db::Database, i64) {
        let db = connect("sqlite::memory:", 1).await.unwrap();
        let p = ProjectRepository::new(&db.pool).create("T", None, None).await.unwrap();
        let v = VolumeRepository::new(&db.pool).create(p.id, "V1", 1, None).await.unwrap();
        (db, v.id)
    }

    #[tokio::test]
    async fn create_computes_word_count() {
        let (db, volume_id) = setup().await;
        let chapters = ChapterRepository::new(&db.pool);
        let c = chapters.create(volume_id, "C1", 1, "hello world", "[]", "[]").await.unwrap();
        assert_eq!(c.word_count, "hello world".chars().count() as i64);
    }

    #[tokio::test]
    async fn set_content_invalidates_summary_by_default() {
        let (db, volume_id) = setup().await;
        let chapters = ChapterRepository::new(&db.pool);
        let c = chapters.create(volume_id, "C1", 1, "body", "[]", "[]").await.unwrap();
        chapters.set_summary(c.id, "a summary").await.unwrap();

        let updated = chapters
            .set_content(c.id, "new body", SummaryPolicy::Invalidate)
            .await
            .unwrap();
        assert!(updated.summary.is_none());
        assert_eq!(updated.word_count, "new body".chars().count() as i64);
    }

    #[tokio::test]
    async fn set_content_can_reuse_existing_summary() {
        let (db, volume_id) = setup().await;
        let chapters = ChapterRepository::new(&db.pool);
        let c = chapters.create(volume_id, "C1", 1, "body", "[]", "[]").await.unwrap();
        chapters.set_summary(c.id, "kept").await.unwrap();

        let updated = chapters
            .set_content(c.id, "new body", SummaryPolicy::ReuseExisting)
            .await
            .unwrap();
        assert_eq!(updated.summary.as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn get_by_order_finds_chapter() {
        let (db, volume_id) = setup().await;
        let chapters = ChapterRepository::new(&db.pool);
        chapters.create(volume_id, "C1", 1, "body", "[]", "[]").await.unwrap();
        let found = chapters.get_by_order(volume_id, 1).await.unwrap();
        assert_eq!(found.title, "C1");
        assert!(chapters.get_by_order(volume_id, 99).await.is_err());
    }
}
