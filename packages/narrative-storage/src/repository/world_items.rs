use chrono::Utc;
use sqlx::SqlitePool;

use crate::domain::WorldItem;
use crate::error::{Result, StorageError};

pub struct WorldItemRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> WorldItemRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, project_id: i64, kind: &str, name: &str, description: &str) -> Result<WorldItem> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO world_items (project_id, kind, name, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project_id)
        .bind(kind)
        .bind(name)
        .bind(description)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await;

        let id = match result {
            Ok(r) => r.last_insert_rowid(),
            Err(e) if is_unique_violation(&e) => {
                return Err(StorageError::constraint(format!(
                    "world item name '{name}' already exists in this project"
                )))
            }
            Err(e) => return Err(e.into()),
        };

        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<WorldItem> {
        sqlx::query_as::<_, WorldItem>("SELECT * FROM world_items WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("world_item", id))
    }

    pub async fn list_for_project(&self, project_id: i64) -> Result<Vec<WorldItem>> {
        Ok(
            sqlx::query_as::<_, WorldItem>("SELECT * FROM world_items WHERE project_id = ? ORDER BY id")
                .bind(project_id)
                .fetch_all(self.pool)
                .await?,
        )
    }

    pub async fn delete_all_for_project(&self, project_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM world_items WHERE project_id = ?")
            .bind(project_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_lorebook_keywords(&self, id: i64, keywords_json: &str) -> Result<()> {
        sqlx::query("UPDATE world_items SET lorebook_keywords = ?, updated_at = ? WHERE id = ?")
            .bind(keywords_json)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM world_items WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE constraint failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect;
    use crate::repository::ProjectRepository;

    #[tokio::test]
    async fn create_and_list() {
        let db = connect("sqlite::memory:", 1).await.unwrap();
        let p = ProjectRepository::new(&db.pool).create("T", None, None).await.unwrap();
        let repo = WorldItemRepository::new(&db.pool);
        repo.create(p.id, "location", "Capital City", "The capital.").await.unwrap();
        let list = repo.list_for_project(p.id).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].kind, "location");
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let db = connect("sqlite::memory:", 1).await.unwrap();
        let p = ProjectRepository::new(&db.pool).create("T", None, None).await.unwrap();
        let repo = WorldItemRepository::new(&db.pool);
        repo.create(p.id, "item", "Sword", "A sword.").await.unwrap();
        let err = repo.create(p.id, "item", "Sword", "Another.").await.unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)));
    }
}
