//! Batch driver over [`WorkflowOrchestrator`]'s per-chapter operations.
//!
//! Owns the loop/concurrency/idempotency-skip/aggregation logic for a
//! multi-chapter run; the actual gather-render-parse-persist work for each
//! chapter still lives on the orchestrator, so there's exactly one place
//! that knows how to build a detail outline or write a chapter.
//!
//! Stage 3 (outline) runs at most once per project and is the one step
//! whose failure aborts the whole batch rather than being captured per
//! task — there are no chapters to fan out over until it succeeds. Stages
//! 4 and 5 are fault-isolated per chapter: one chapter's failure is
//! recorded and the run continues.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use narrative_storage::repository::{ChapterRepository, ProjectRepository, VolumeRepository};
use narrative_storage::{Chapter, ProjectStage};
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::error::{EngineError, Result};
use crate::parsing::parse_chapter_range;
use crate::workflow_orchestrator::{PipelineStage, TaskOutcome, WorkflowOrchestrator};

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub from_step: i64,
    pub to_step: i64,
    pub chapter_range: Option<String>,
    pub regenerate: bool,
    pub max_workers: usize,
    pub provider: Option<String>,
}

impl Default for BatchRequest {
    fn default() -> Self {
        Self {
            from_step: 4,
            to_step: 5,
            chapter_range: None,
            regenerate: false,
            max_workers: 1,
            provider: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub total_chapters: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_chapter_ids: Vec<i64>,
    pub tasks: Vec<TaskOutcome>,
}

impl PipelineResult {
    fn tally(total_chapters: usize, tasks: Vec<TaskOutcome>) -> Self {
        let succeeded = tasks.iter().filter(|t| t.success).count();
        let failed = tasks.iter().filter(|t| !t.success && !t.skipped).count();
        let skipped = tasks.iter().filter(|t| t.skipped).count();
        let failed_chapter_ids: HashSet<i64> = tasks.iter().filter(|t| !t.success && !t.skipped).map(|t| t.chapter_id).collect();
        let mut failed_chapter_ids: Vec<i64> = failed_chapter_ids.into_iter().collect();
        failed_chapter_ids.sort_unstable();

        Self {
            total_chapters,
            succeeded,
            failed,
            skipped,
            failed_chapter_ids,
            tasks,
        }
    }
}

pub async fn run_pipeline(orchestrator: &WorkflowOrchestrator, project_id: i64, request: BatchRequest) -> Result<PipelineResult> {
    if !(3..=5).contains(&request.from_step) || !(3..=5).contains(&request.to_step) || request.from_step > request.to_step {
        return Err(EngineError::invalid_plan(format!(
            "invalid step range {}..={}: from_step and to_step must each be within 3..=5, and from_step <= to_step",
            request.from_step, request.to_step
        )));
    }

    let mut tasks = Vec::new();

    if request.from_step <= 3 && 3 <= request.to_step {
        run_outline_step(orchestrator, project_id, request.regenerate, request.provider.as_deref()).await?;
    }

    if request.to_step < 4 {
        return Ok(PipelineResult::tally(0, tasks));
    }

    let all_chapters = ChapterRepository::new(&orchestrator.db().pool).list_for_project(project_id).await?;
    let indices = parse_chapter_range(request.chapter_range.as_deref(), all_chapters.len() as i64)?;
    let chapters: Vec<Chapter> = indices.into_iter().filter_map(|i| all_chapters.get((i - 1) as usize).cloned()).collect();
    let total_chapters = chapters.len();

    let run_step4 = request.from_step <= 4 && 4 <= request.to_step;
    let run_step5 = request.from_step <= 5 && 5 <= request.to_step;
    let provider = request.provider.as_deref();

    if request.max_workers <= 1 {
        run_serial(orchestrator, &chapters, run_step4, run_step5, request.regenerate, provider, &mut tasks).await;
    } else {
        run_parallel(orchestrator, &chapters, run_step4, run_step5, request.regenerate, request.max_workers, provider, &mut tasks).await;
    }

    Ok(PipelineResult::tally(total_chapters, tasks))
}

async fn run_outline_step(orchestrator: &WorkflowOrchestrator, project_id: i64, regenerate: bool, provider: Option<&str>) -> Result<()> {
    let project = ProjectRepository::new(&orchestrator.db().pool).get(project_id).await?;
    let volumes = VolumeRepository::new(&orchestrator.db().pool).list_for_project(project_id).await?;
    let already_built = !volumes.is_empty() && project.current_step >= ProjectStage::Outline.rank();
    if already_built && !regenerate {
        return Ok(());
    }
    orchestrator.build_outline(project_id, provider).await?;
    Ok(())
}

async fn run_serial(
    orchestrator: &WorkflowOrchestrator,
    chapters: &[Chapter],
    run_step4: bool,
    run_step5: bool,
    regenerate: bool,
    provider: Option<&str>,
    tasks: &mut Vec<TaskOutcome>,
) {
    for chapter in chapters {
        let mut step4_failed = false;
        if run_step4 {
            let outcome = if !regenerate && has_detail_outline(chapter) {
                TaskOutcome::skipped(chapter.id, &chapter.title, PipelineStage::DetailOutline, "already has a detail outline")
            } else {
                let outcome = orchestrator.dispatch_detail_outline(chapter, provider).await;
                step4_failed = !outcome.success;
                outcome
            };
            tasks.push(outcome);
        }

        if run_step5 {
            let outcome = if run_step4 && step4_failed {
                TaskOutcome::skipped(chapter.id, &chapter.title, PipelineStage::Writing, "skipped because step 4 failed for this chapter")
            } else if !regenerate && chapter.has_content() {
                TaskOutcome::skipped(chapter.id, &chapter.title, PipelineStage::Writing, "already has content")
            } else {
                orchestrator.dispatch_write(chapter, provider).await
            };
            tasks.push(outcome);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_parallel(
    orchestrator: &WorkflowOrchestrator,
    chapters: &[Chapter],
    run_step4: bool,
    run_step5: bool,
    regenerate: bool,
    max_workers: usize,
    provider: Option<&str>,
    tasks: &mut Vec<TaskOutcome>,
) {
    let provider = provider.map(str::to_string);
    let mut failed_step4: HashSet<i64> = HashSet::new();

    if run_step4 {
        let semaphore = Arc::new(Semaphore::new(max_workers));
        let mut handles = Vec::new();
        for chapter in chapters {
            if !regenerate && has_detail_outline(chapter) {
                tasks.push(TaskOutcome::skipped(chapter.id, &chapter.title, PipelineStage::DetailOutline, "already has a detail outline"));
                continue;
            }
            let orchestrator = orchestrator.clone();
            let semaphore = semaphore.clone();
            let provider = provider.clone();
            let chapter = chapter.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("pipeline semaphore should never be closed");
                orchestrator.dispatch_detail_outline(&chapter, provider.as_deref()).await
            }));
        }
        for handle in join_all(handles).await {
            let outcome = handle.expect("detail outline worker task panicked");
            if !outcome.success {
                failed_step4.insert(outcome.chapter_id);
            }
            tasks.push(outcome);
        }
    }

    if run_step5 {
        let semaphore = Arc::new(Semaphore::new(max_workers));
        let mut handles = Vec::new();
        for chapter in chapters {
            if run_step4 && failed_step4.contains(&chapter.id) {
                tasks.push(TaskOutcome::skipped(chapter.id, &chapter.title, PipelineStage::Writing, "skipped because step 4 failed for this chapter"));
                continue;
            }
            if !regenerate && chapter.has_content() {
                tasks.push(TaskOutcome::skipped(chapter.id, &chapter.title, PipelineStage::Writing, "already has content"));
                continue;
            }
            let orchestrator = orchestrator.clone();
            let semaphore = semaphore.clone();
            let provider = provider.clone();
            let chapter = chapter.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("pipeline semaphore should never be closed");
                orchestrator.dispatch_write(&chapter, provider.as_deref()).await
            }));
        }
        for handle in join_all(handles).await {
            tasks.push(handle.expect("write worker task panicked"));
        }
    }
}

fn has_detail_outline(chapter: &Chapter) -> bool {
    chapter.detail_outline.as_deref().is_some_and(|o| !o.is_empty())
}

#[cfg(test)]
mod tests {
    use narrative_storage::db::connect;
    use narrative_storage::repository::CharacterRepository;

    use super::*;
    use crate::config::EngineConfig;
    use crate::providers::ProviderCredentials;

    async fn setup_project_with_chapters(chapter_count: i64) -> (WorkflowOrchestrator, i64) {
        let db = connect("sqlite::memory:", 4).await.unwrap();
        let project = ProjectRepository::new(&db.pool).create("T", None, None).await.unwrap();
        ProjectRepository::new(&db.pool).set_planning_text(project.id, "plan").await.unwrap();
        CharacterRepository::new(&db.pool).create(project.id, "Mira", None, None).await.unwrap();
        let volume = VolumeRepository::new(&db.pool).create(project.id, "V1", 1, None).await.unwrap();
        for order in 1..=chapter_count {
            ChapterRepository::new(&db.pool)
                .create(volume.id, &format!("Chapter {order}"), order, "", "[]", "[]")
                .await
                .unwrap();
        }
        ProjectRepository::new(&db.pool).advance_stage(project.id, ProjectStage::Outline).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut provider_credentials = std::collections::HashMap::new();
        provider_credentials.insert(
            "openai".to_string(),
            ProviderCredentials {
                api_key: "test-key".to_string(),
                base_url: None,
                model: "gpt-4o".to_string(),
            },
        );
        let config = EngineConfig {
            database_url: "sqlite::memory:".to_string(),
            default_provider: "openai".to_string(),
            provider_credentials,
            daily_budget: 100.0,
            cost_ledger_path: dir.path().join("ledger.json"),
            rewrite_history_dir: dir.path().join("history"),
            embedding_api_key: None,
            embedding_api_base: None,
            stage_defaults: crate::config::StageDefaults::default(),
        };
        let orchestrator = WorkflowOrchestrator::new(db, config).unwrap();
        (orchestrator, project.id)
    }

    #[tokio::test]
    async fn rejects_a_step_range_outside_three_to_five() {
        let (orchestrator, project_id) = setup_project_with_chapters(1).await;
        let request = BatchRequest {
            from_step: 2,
            to_step: 4,
            ..Default::default()
        };
        let err = run_pipeline(&orchestrator, project_id, request).await.unwrap_err();
        assert!(matches!(err, EngineError::PipelineInvalidPlan(_)));
    }

    #[tokio::test]
    async fn rejects_from_step_greater_than_to_step() {
        let (orchestrator, project_id) = setup_project_with_chapters(1).await;
        let request = BatchRequest {
            from_step: 5,
            to_step: 4,
            ..Default::default()
        };
        let err = run_pipeline(&orchestrator, project_id, request).await.unwrap_err();
        assert!(matches!(err, EngineError::PipelineInvalidPlan(_)));
    }

    #[tokio::test]
    async fn skip_entries_count_toward_the_skipped_tally_when_already_done() {
        let (orchestrator, project_id) = setup_project_with_chapters(1).await;
        let chapters = ChapterRepository::new(&orchestrator.db().pool).list_for_project(project_id).await.unwrap();
        ChapterRepository::new(&orchestrator.db().pool).set_detail_outline(chapters[0].id, "{}").await.unwrap();

        let request = BatchRequest {
            from_step: 4,
            to_step: 4,
            max_workers: 1,
            ..Default::default()
        };
        let result = run_pipeline(&orchestrator, project_id, request).await.unwrap();
        assert_eq!(result.total_chapters, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.succeeded, 0);
        assert_eq!(result.failed, 0);
    }
}
