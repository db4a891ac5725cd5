use chrono::Utc;
use sqlx::SqlitePool;

use crate::domain::Character;
use crate::error::{Result, StorageError};

pub struct CharacterRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CharacterRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        project_id: i64,
        name: &str,
        archetype: Option<&str>,
        background: Option<&str>,
    ) -> Result<Character> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO characters
                (project_id, name, archetype, background, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project_id)
        .bind(name)
        .bind(archetype)
        .bind(background)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await;

        let id = match result {
            Ok(r) => r.last_insert_rowid(),
            Err(e) if is_unique_violation(&e) => {
                return Err(StorageError::constraint(format!(
                    "character name '{name}' already exists in this project"
                )))
            }
            Err(e) => return Err(e.into()),
        };

        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Character> {
        sqlx::query_as::<_, Character>("SELECT * FROM characters WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("character", id))
    }

    pub async fn get_by_name(&self, project_id: i64, name: &str) -> Result<Character> {
        sqlx::query_as::<_, Character>("SELECT * FROM characters WHERE project_id = ? AND name = ?")
            .bind(project_id)
            .bind(name)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("character", name))
    }

    pub async fn list_for_project(&self, project_id: i64) -> Result<Vec<Character>> {
        Ok(
            sqlx::query_as::<_, Character>("SELECT * FROM characters WHERE project_id = ? ORDER BY id")
                .bind(project_id)
                .fetch_all(self.pool)
                .await?,
        )
    }

    pub async fn delete_all_for_project(&self, project_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM characters WHERE project_id = ?")
            .bind(project_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_volatile_state(
        &self,
        id: i64,
        current_mood: Option<&str>,
        current_status: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE characters SET current_mood = ?, current_status = ?, updated_at = ? WHERE id = ?")
            .bind(current_mood)
            .bind(current_status)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_lorebook_keywords(&self, id: i64, keywords_json: &str) -> Result<()> {
        sqlx::query("UPDATE characters SET lorebook_keywords = ?, updated_at = ? WHERE id = ?")
            .bind(keywords_json)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM characters WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE constraint failed"))
}
