use chrono::Utc;
use sqlx::SqlitePool;

use crate::domain::Volume;
use crate::error::{Result, StorageError};

pub struct VolumeRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> VolumeRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        project_id: i64,
        title: &str,
        order: i64,
        description: Option<&str>,
    ) -> Result<Volume> {
        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO volumes (project_id, title, "order", description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project_id)
        .bind(title)
        .bind(order)
        .bind(description)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?
        .last_insert_rowid();

        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Volume> {
        sqlx::query_as::<_, Volume>("SELECT * FROM volumes WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("volume", id))
    }

    pub async fn list_for_project(&self, project_id: i64) -> Result<Vec<Volume>> {
        Ok(sqlx::query_as::<_, Volume>(
            r#"SELECT * FROM volumes WHERE project_id = ? ORDER BY "order""#,
        )
        .bind(project_id)
        .fetch_all(self.pool)
        .await?)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM volumes WHERE id = ?")
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
    async fn create_and_list_ordered() {
        let db = connect("sqlite::memory:", 1).await.unwrap();
        let projects = ProjectRepository::new(&db.pool);
        let p = projects.create("T", None, None).await.unwrap();

        let volumes = VolumeRepository::new(&db.pool);
        volumes.create(p.id, "Vol 2", 2, None).await.unwrap();
        volumes.create(p.id, "Vol 1", 1, None).await.unwrap();

        let list = volumes.list_for_project(p.id).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].order, 1);
        assert_eq!(list[1].order, 2);
    }
}
