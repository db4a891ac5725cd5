use chrono::Utc;
use sqlx::SqlitePool;

use crate::domain::{PlotArc, PlotArcStatus};
use crate::error::{Result, StorageError};

pub struct PlotArcRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> PlotArcRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        project_id: i64,
        name: &str,
        description: &str,
        planted_chapter: Option<i64>,
        importance: &str,
    ) -> Result<PlotArc> {
        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO plot_arcs
                (project_id, name, description, status, planted_chapter, importance, created_at, updated_at)
            VALUES (?, ?, ?, 'planted', ?, ?, ?, ?)
            "#,
        )
        .bind(project_id)
        .bind(name)
        .bind(description)
        .bind(planted_chapter)
        .bind(importance)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?
        .last_insert_rowid();

        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<PlotArc> {
        sqlx::query_as::<_, PlotArc>("SELECT * FROM plot_arcs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("plot_arc", id))
    }

    pub async fn list_for_project(&self, project_id: i64) -> Result<Vec<PlotArc>> {
        Ok(
            sqlx::query_as::<_, PlotArc>("SELECT * FROM plot_arcs WHERE project_id = ? ORDER BY id")
                .bind(project_id)
                .fetch_all(self.pool)
                .await?,
        )
    }

    /// Arcs in a non-terminal state (`planted` or `developing`).
    pub async fn get_active(&self, project_id: i64) -> Result<Vec<PlotArc>> {
        Ok(sqlx::query_as::<_, PlotArc>(
            "SELECT * FROM plot_arcs WHERE project_id = ? AND status IN ('planted', 'developing') ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(self.pool)
        .await?)
    }

    pub async fn get_without_embedding(&self, project_id: i64) -> Result<Vec<PlotArc>> {
        Ok(sqlx::query_as::<_, PlotArc>(
            "SELECT * FROM plot_arcs WHERE project_id = ? AND embedding IS NULL ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(self.pool)
        .await?)
    }

    /// Advances the arc's lifecycle state, enforcing the state machine
    /// (`planted -> developing -> resolved`, `abandoned` reachable from any
    /// non-terminal state, terminal states reject further transitions) and
    /// the `resolved_chapter >= planted_chapter` invariant.
    pub async fn transition(
        &self,
        id: i64,
        new_status: PlotArcStatus,
        resolved_chapter: Option<i64>,
    ) -> Result<PlotArc> {
        let arc = self.get(id).await?;
        let current = arc.status();

        if current.is_terminal() {
            return Err(StorageError::constraint(format!(
                "plot arc {id} is already in terminal state {}",
                current.as_str()
            )));
        }

        let valid = matches!(
            (current, new_status),
            (PlotArcStatus::Planted, PlotArcStatus::Developing)
                | (PlotArcStatus::Planted, PlotArcStatus::Resolved)
                | (PlotArcStatus::Developing, PlotArcStatus::Resolved)
                | (PlotArcStatus::Planted, PlotArcStatus::Abandoned)
                | (PlotArcStatus::Developing, PlotArcStatus::Abandoned)
        );
        if !valid {
            return Err(StorageError::constraint(format!(
                "invalid plot arc transition {} -> {}",
                current.as_str(),
                new_status.as_str()
            )));
        }

        if new_status == PlotArcStatus::Resolved {
            let resolved_chapter = resolved_chapter
                .ok_or_else(|| StorageError::constraint("resolving a plot arc requires resolved_chapter"))?;
            if let Some(planted) = arc.planted_chapter {
                if resolved_chapter < planted {
                    return Err(StorageError::constraint(
                        "resolved_chapter must be >= planted_chapter",
                    ));
                }
            }
            sqlx::query(
                "UPDATE plot_arcs SET status = ?, resolved_chapter = ?, updated_at = ? WHERE id = ?",
            )
            .bind(new_status.as_str())
            .bind(resolved_chapter)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        } else {
            sqlx::query("UPDATE plot_arcs SET status = ?, updated_at = ? WHERE id = ?")
                .bind(new_status.as_str())
                .bind(Utc::now())
                .bind(id)
                .execute(self.pool)
                .await?;
        }

        self.get(id).await
    }

    pub async fn set_embedding(&self, id: i64, embedding_json: &str) -> Result<()> {
        sqlx::query("UPDATE plot_arcs SET embedding = ?, updated_at = ? WHERE id = ?")
            .bind(embedding_json)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM plot_arcs WHERE id = ?")
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

    async fn setup_arc() -> (crate::db::Database, PlotArc) {
        let db = connect("sqlite::memory:", 1).await.unwrap();
        let p = ProjectRepository::new(&db.pool).create("T", None, None).await.unwrap();
        let repo = PlotArcRepository::new(&db.pool);
        let arc = repo.create(p.id, "The Lost Sword", "desc", Some(3), "high").await.unwrap();
        (db, arc)
    }

    #[tokio::test]
    async fn planted_to_resolved_requires_resolved_chapter() {
        let (db, arc) = setup_arc().await;
        let repo = PlotArcRepository::new(&db.pool);
        let err = repo.transition(arc.id, PlotArcStatus::Resolved, None).await.unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)));
    }

    #[tokio::test]
    async fn resolved_chapter_must_not_precede_planted_chapter() {
        let (db, arc) = setup_arc().await;
        let repo = PlotArcRepository::new(&db.pool);
        let err = repo
            .transition(arc.id, PlotArcStatus::Resolved, Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)));
    }

    #[tokio::test]
    async fn valid_transition_chain_succeeds() {
        let (db, arc) = setup_arc().await;
        let repo = PlotArcRepository::new(&db.pool);
        let arc = repo.transition(arc.id, PlotArcStatus::Developing, None).await.unwrap();
        assert_eq!(arc.status(), PlotArcStatus::Developing);
        let arc = repo.transition(arc.id, PlotArcStatus::Resolved, Some(5)).await.unwrap();
        assert_eq!(arc.status(), PlotArcStatus::Resolved);
        assert_eq!(arc.resolved_chapter, Some(5));
    }

    #[tokio::test]
    async fn terminal_state_rejects_further_transitions() {
        let (db, arc) = setup_arc().await;
        let repo = PlotArcRepository::new(&db.pool);
        let arc = repo.transition(arc.id, PlotArcStatus::Abandoned, None).await.unwrap();
        assert_eq!(arc.status(), PlotArcStatus::Abandoned);
        let err = repo.transition(arc.id, PlotArcStatus::Developing, None).await.unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)));
    }
}
