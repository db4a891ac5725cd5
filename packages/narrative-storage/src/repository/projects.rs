use chrono::Utc;
use sqlx::SqlitePool;

use crate::domain::{Project, ProjectStage};
use crate::error::{Result, StorageError};

/// Explicit, typed set of fields the caller may edit on a project. Fields
/// left `None` are left untouched — this is the engine's replacement for the
/// source system's open-ended keyword-argument update call.
#[derive(Debug, Default, Clone)]
pub struct ProjectUpdate {
    pub title: Option<String>,
    pub author: Option<String>,
    pub genre: Option<String>,
    pub plot_tags: Option<Vec<String>>,
    pub description: Option<String>,
}

pub struct ProjectRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ProjectRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, title: &str, author: Option<&str>, genre: Option<&str>) -> Result<Project> {
        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO projects (title, author, genre, plot_tags, stage, current_step, created_at, updated_at)
            VALUES (?, ?, ?, '[]', 'created', 0, ?, ?)
            "#,
        )
        .bind(title)
        .bind(author)
        .bind(genre)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?
        .last_insert_rowid();

        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Project> {
        sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("project", id))
    }

    pub async fn list(&self) -> Result<Vec<Project>> {
        Ok(sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY id")
            .fetch_all(self.pool)
            .await?)
    }

    pub async fn update(&self, id: i64, update: ProjectUpdate) -> Result<Project> {
        if let Some(title) = &update.title {
            if title.trim().is_empty() {
                return Err(StorageError::constraint("project title cannot be empty"));
            }
        }
        let now = Utc::now();
        let existing = self.get(id).await?;

        let title = update.title.unwrap_or(existing.title);
        let author = update.author.or(existing.author);
        let genre = update.genre.or(existing.genre);
        let plot_tags = match update.plot_tags {
            Some(tags) => serde_json::to_string(&tags)?,
            None => existing.plot_tags,
        };
        let description = update.description.or(existing.description);

        sqlx::query(
            r#"
            UPDATE projects
            SET title = ?, author = ?, genre = ?, plot_tags = ?, description = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(title)
        .bind(author)
        .bind(genre)
        .bind(plot_tags)
        .bind(description)
        .bind(now)
        .bind(id)
        .execute(self.pool)
        .await?;

        self.get(id).await
    }

    /// Overwrites `planning_text`; does not touch `current_step` (explicit
    /// edit path, per the stage-advancement rule).
    pub async fn set_planning_text(&self, id: i64, text: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET planning_text = ?, updated_at = ? WHERE id = ?")
            .bind(text)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_world_building_raw(&self, id: i64, raw: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET world_building_raw = ?, updated_at = ? WHERE id = ?")
            .bind(raw)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_outline_raw(&self, id: i64, raw: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET outline_raw = ?, updated_at = ? WHERE id = ?")
            .bind(raw)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Advances `stage`/`current_step`, enforcing the never-regress invariant
    /// (`current_step` only ever increases).
    pub async fn advance_stage(&self, id: i64, stage: ProjectStage) -> Result<Project> {
        let existing = self.get(id).await?;
        let new_step = existing.current_step.max(stage.rank());
        sqlx::query("UPDATE projects SET stage = ?, current_step = ?, updated_at = ? WHERE id = ?")
            .bind(stage.as_str())
            .bind(new_step)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        self.get(id).await
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect;

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let db = connect("sqlite::memory:", 1).await.unwrap();
        let repo = ProjectRepository::new(&db.pool);
        let p = repo.create("My Novel", Some("Author"), None).await.unwrap();
        assert_eq!(p.title, "My Novel");
        assert_eq!(p.stage(), ProjectStage::Created);
        assert_eq!(p.current_step, 0);

        let fetched = repo.get(p.id).await.unwrap();
        assert_eq!(fetched.id, p.id);
    }

    #[tokio::test]
    async fn advance_stage_never_regresses() {
        let db = connect("sqlite::memory:", 1).await.unwrap();
        let repo = ProjectRepository::new(&db.pool);
        let p = repo.create("T", None, None).await.unwrap();

        let p = repo.advance_stage(p.id, ProjectStage::Outline).await.unwrap();
        assert_eq!(p.current_step, 3);

        let p = repo.advance_stage(p.id, ProjectStage::Planning).await.unwrap();
        assert_eq!(p.current_step, 3, "current_step must not regress");
    }

    #[tokio::test]
    async fn update_rejects_empty_title() {
        let db = connect("sqlite::memory:", 1).await.unwrap();
        let repo = ProjectRepository::new(&db.pool);
        let p = repo.create("T", None, None).await.unwrap();
        let err = repo
            .update(
                p.id,
                ProjectUpdate {
                    title: Some("   ".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)));
    }

    #[tokio::test]
    async fn get_missing_project_is_not_found() {
        let db = connect("sqlite::memory:", 1).await.unwrap();
        let repo = ProjectRepository::new(&db.pool);
        let err = repo.get(999).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }
}
