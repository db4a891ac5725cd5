use chrono::Utc;
use sqlx::SqlitePool;

use crate::domain::StyleProfile;
use crate::error::{Result, StorageError};

pub struct StyleProfileRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> StyleProfileRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        project_id: i64,
        name: &str,
        source_text: &str,
        features_json: &str,
        style_guide: &str,
    ) -> Result<StyleProfile> {
        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO style_profiles
                (project_id, name, source_text, features, style_guide, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(project_id)
        .bind(name)
        .bind(source_text)
        .bind(features_json)
        .bind(style_guide)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?
        .last_insert_rowid();

        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<StyleProfile> {
        sqlx::query_as::<_, StyleProfile>("SELECT * FROM style_profiles WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("style_profile", id))
    }

    pub async fn list_for_project(&self, project_id: i64) -> Result<Vec<StyleProfile>> {
        Ok(sqlx::query_as::<_, StyleProfile>(
            "SELECT * FROM style_profiles WHERE project_id = ? ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(self.pool)
        .await?)
    }

    /// At most one active profile per project (invariant 3): activating one
    /// deactivates all its siblings within the same unit of work.
    pub async fn get_active(&self, project_id: i64) -> Result<Option<StyleProfile>> {
        Ok(sqlx::query_as::<_, StyleProfile>(
            "SELECT * FROM style_profiles WHERE project_id = ? AND is_active = 1",
        )
        .bind(project_id)
        .fetch_optional(self.pool)
        .await?)
    }

    pub async fn activate(&self, id: i64) -> Result<StyleProfile> {
        let profile = self.get(id).await?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE style_profiles SET is_active = 0, updated_at = ? WHERE project_id = ?")
            .bind(Utc::now())
            .bind(profile.project_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE style_profiles SET is_active = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.get(id).await
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM style_profiles WHERE id = ?")
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
    use crate::repository::ProjectRepository;

    #[tokio::test]
    async fn activating_one_deactivates_others() {
        let db = connect("sqlite::memory:", 1).await.unwrap();
        let p = ProjectRepository::new(&db.pool).create("T", None, None).await.unwrap();
        let repo = StyleProfileRepository::new(&db.pool);
        let a = repo.create(p.id, "A", "src", "{}", "guide").await.unwrap();
        let b = repo.create(p.id, "B", "src", "{}", "guide").await.unwrap();

        repo.activate(a.id).await.unwrap();
        assert_eq!(repo.get_active(p.id).await.unwrap().unwrap().id, a.id);

        repo.activate(b.id).await.unwrap();
        let active = repo.get_active(p.id).await.unwrap().unwrap();
        assert_eq!(active.id, b.id);

        let a_refetched = repo.get(a.id).await.unwrap();
        assert!(!a_refetched.is_active);
    }
}
