//! Single entry point over every operation in the generation pipeline.
//!
//! Each public method here gathers inputs from persistence, delegates the
//! actual generation to a stage generator or service, and persists the
//! result. Stage advancement (`Project.stage`/`current_step`) only happens
//! on the methods that correspond to moving the project forward; the
//! `update_*` methods overwrite an artifact without touching progress,
//! mirroring the behavior [`narrative_storage::repository::ProjectRepository`]
//! already gives its `set_planning_text`/`set_world_building_raw`/
//! `set_outline_raw` setters.

use std::sync::Arc;

use narrative_storage::repository::chapters::SummaryPolicy;
use narrative_storage::repository::{
    CharacterRepository, ChapterRepository, ProjectRepository, StyleProfileRepository, VolumeRepository, WorldItemRepository,
};
use narrative_storage::{Chapter, Database, ProjectStage, Volume};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::context_assembler::ContextAssembler;
use crate::cost_ledger::CostLedger;
use crate::error::{EngineError, Result};
use crate::lorebook;
use crate::providers::{GenerationClient, ProviderRegistry};
use crate::stages::consistency_check::{ConsistencyCheckGenerator, ConsistencyReport};
use crate::stages::detail_outline::{DetailOutlineDraft, DetailOutlineGenerator};
use crate::stages::outline::OutlineGenerator;
use crate::stages::planning::{PlanResult, PlanningGenerator};
use crate::stages::quality_check::{QualityCheckGenerator, QualityCheckResult};
use crate::stages::rewrite::{RewriteOutcome, RewriteScope, RewriteService};
use crate::stages::rollback::{RollbackOutcome, RollbackService};
use crate::stages::world_building::WorldBuildingGenerator;
use crate::stages::writing::{WritingGenerator, WritingResult};
use crate::stages::{simple_recap, GenerationStats};

const RECAP_WINDOW: i64 = 3;
const RECAP_TOKEN_BUDGET: i64 = 800;
const PLOT_ARC_TOP_K: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub stage: String,
    pub current_step: i64,
    pub can_continue: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildWorldOutcome {
    pub characters: Vec<narrative_storage::Character>,
    pub world_data: Vec<narrative_storage::WorldItem>,
    pub stats: GenerationStats,
    pub raw: Option<String>,
    pub parse_failed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildOutlineOutcome {
    pub volumes: Vec<Volume>,
    pub stats: GenerationStats,
    pub raw: Option<String>,
    pub parse_failed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailOutlineOutcome {
    pub chapter_id: i64,
    pub draft: Option<DetailOutlineDraft>,
    pub stats: GenerationStats,
    pub parse_failed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub total_chapters: usize,
    pub with_outline: usize,
    pub with_content: usize,
    pub missing_outline: Vec<i64>,
    pub missing_content: Vec<i64>,
}

/// Composition root for every generation operation: holds the storage
/// handle, the provider cache, the cost ledger, and per-stage generation
/// parameters. Cheap to clone — every field is either a pooled handle or an
/// `Arc` — so concurrent pipeline workers each hold their own clone rather
/// than sharing a borrow across a `tokio::spawn` boundary.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    db: Database,
    registry: Arc<ProviderRegistry>,
    ledger: Arc<CostLedger>,
    config: EngineConfig,
    rewrite_service: RewriteService,
    rollback_service: RollbackService,
}

impl WorkflowOrchestrator {
    pub fn new(db: Database, config: EngineConfig) -> Result<Self> {
        let ledger = Arc::new(CostLedger::open(&config.cost_ledger_path, config.daily_budget)?);
        let rewrite_service = RewriteService::new(db.clone(), config.rewrite_history_dir.clone());
        let rollback_service = RollbackService::new(db.clone(), RewriteService::new(db.clone(), config.rewrite_history_dir.clone()));
        Ok(Self {
            db,
            registry: Arc::new(ProviderRegistry::new()),
            ledger,
            config,
            rewrite_service,
            rollback_service,
        })
    }

    fn client(&self, provider: Option<&str>) -> Result<Arc<dyn GenerationClient>> {
        let provider = provider.unwrap_or(&self.config.default_provider);
        let creds = self.config.credentials_for(provider)?;
        self.registry.get_or_create(provider, creds)
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub async fn status(&self, project_id: i64) -> Result<ProjectStatus> {
        let project = ProjectRepository::new(&self.db.pool).get(project_id).await?;
        let stage = project.stage();
        Ok(ProjectStatus {
            stage: stage.as_str().to_string(),
            current_step: project.current_step,
            can_continue: !matches!(stage, ProjectStage::Completed),
        })
    }

    pub async fn plan(&self, project_id: i64, seed_idea: Option<&str>, provider: Option<&str>) -> Result<PlanResult> {
        let projects = ProjectRepository::new(&self.db.pool);
        let project = projects.get(project_id).await?;
        let seed = seed_idea
            .map(str::to_string)
            .or_else(|| project.description.clone())
            .unwrap_or_default();

        let client = self.client(provider)?;
        let defaults = self.config.stage_defaults.planning;
        let result = PlanningGenerator::new()
            .generate(&*client, &self.ledger, &project.title, &seed, defaults.temperature, defaults.max_tokens)
            .await?;

        projects.set_planning_text(project_id, &result.planning_text).await?;
        projects.advance_stage(project_id, ProjectStage::Planning).await?;
        Ok(result)
    }

    pub async fn update_plan(&self, project_id: i64, text: &str) -> Result<()> {
        ProjectRepository::new(&self.db.pool).set_planning_text(project_id, text).await?;
        Ok(())
    }

    pub async fn build_world(&self, project_id: i64, provider: Option<&str>) -> Result<BuildWorldOutcome> {
        let projects = ProjectRepository::new(&self.db.pool);
        let project = projects.get(project_id).await?;
        let planning_text = project
            .planning_text
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| EngineError::insufficient_data(format!("project {project_id} has no planning text yet"), "project.planning_text"))?;

        let client = self.client(provider)?;
        let defaults = self.config.stage_defaults.world_building;
        let result = WorldBuildingGenerator::new()
            .generate(&*client, &self.ledger, &planning_text, defaults.temperature, defaults.max_tokens)
            .await?;

        projects.set_world_building_raw(project_id, &result.raw_content).await?;

        let Some(draft) = result.draft else {
            return Ok(BuildWorldOutcome {
                characters: Vec::new(),
                world_data: Vec::new(),
                stats: result.stats,
                raw: Some(result.raw_content),
                parse_failed: true,
            });
        };

        let world_repo = WorldItemRepository::new(&self.db.pool);
        let mut world_data = Vec::with_capacity(draft.world_data.len());
        for item in &draft.world_data {
            let created = world_repo.create(project_id, &item.data_type, &item.name, &item.description).await?;
            if !item.lorebook_keywords.is_empty() {
                world_repo.set_lorebook_keywords(created.id, &serde_json::to_string(&item.lorebook_keywords)?).await?;
            }
            world_data.push(world_repo.get(created.id).await?);
        }

        let characters_repo = CharacterRepository::new(&self.db.pool);
        let mut characters = Vec::with_capacity(draft.characters.len());
        for character in &draft.characters {
            let created = characters_repo
                .create(project_id, &character.name, character.archetype.as_deref(), character.background.as_deref())
                .await?;
            if !character.lorebook_keywords.is_empty() {
                characters_repo.set_lorebook_keywords(created.id, &serde_json::to_string(&character.lorebook_keywords)?).await?;
            }
            characters.push(characters_repo.get(created.id).await?);
        }

        projects.advance_stage(project_id, ProjectStage::WorldBuilding).await?;

        Ok(BuildWorldOutcome {
            characters,
            world_data,
            stats: result.stats,
            raw: None,
            parse_failed: false,
        })
    }

    pub async fn update_world(&self, project_id: i64, raw_text: &str) -> Result<()> {
        ProjectRepository::new(&self.db.pool).set_world_building_raw(project_id, raw_text).await?;
        Ok(())
    }

    pub async fn build_outline(&self, project_id: i64, provider: Option<&str>) -> Result<BuildOutlineOutcome> {
        let projects = ProjectRepository::new(&self.db.pool);
        let project = projects.get(project_id).await?;

        let characters = CharacterRepository::new(&self.db.pool).list_for_project(project_id).await?;
        if characters.is_empty() {
            return Err(EngineError::insufficient_data(
                format!("project {project_id} has no characters yet"),
                "characters",
            ));
        }
        let world_items = WorldItemRepository::new(&self.db.pool).list_for_project(project_id).await?;

        let character_names: Vec<&str> = characters.iter().map(|c| c.name.as_str()).collect();
        let world_summary: Vec<String> = world_items.iter().map(|w| format!("{}: {}", w.name, w.description)).collect();
        let planning_text = project.planning_text.clone().unwrap_or_default();

        let prompt = format!(
            "Build a complete volume and chapter outline for the novel \"{}\".\n\n\
             Plan:\n{planning_text}\n\n\
             World knowledge:\n{}\n\n\
             Characters: {}\n\n\
             Respond with a single JSON object, and nothing else: \
             {{\"volumes\": [{{\"title\": \"...\", \"order\": 1, \"description\": \"...\", \"chapters\": [\
             {{\"title\": \"...\", \"order\": 1, \"summary\": \"...\", \"key_events\": [\"...\"], \"characters_involved\": [\"...\"]}}]}}]}}",
            project.title,
            world_summary.join("\n"),
            character_names.join(", "),
        );

        let client = self.client(provider)?;
        let defaults = self.config.stage_defaults.outline;
        let result = OutlineGenerator::new()
            .generate(&*client, &self.ledger, &prompt, defaults.temperature, defaults.max_tokens)
            .await?;

        projects.set_outline_raw(project_id, &result.raw_content).await?;

        let Some(draft) = result.draft else {
            return Ok(BuildOutlineOutcome {
                volumes: Vec::new(),
                stats: result.stats,
                raw: Some(result.raw_content),
                parse_failed: true,
            });
        };

        let volumes_repo = VolumeRepository::new(&self.db.pool);
        let chapters_repo = ChapterRepository::new(&self.db.pool);
        let mut volumes = Vec::with_capacity(draft.volumes.len());
        for volume_draft in &draft.volumes {
            let description = Some(volume_draft.description.as_str()).filter(|d| !d.is_empty());
            let volume = volumes_repo.create(project_id, &volume_draft.title, volume_draft.order, description).await?;
            for chapter_draft in &volume_draft.chapters {
                let key_events = serde_json::to_string(&chapter_draft.key_events)?;
                let characters_involved = serde_json::to_string(&chapter_draft.characters_involved)?;
                let chapter = chapters_repo.create(volume.id, &chapter_draft.title, chapter_draft.order, "", &key_events, &characters_involved).await?;
                if !chapter_draft.summary.is_empty() {
                    chapters_repo.set_summary(chapter.id, &chapter_draft.summary).await?;
                }
            }
            volumes.push(volume);
        }

        projects.advance_stage(project_id, ProjectStage::Outline).await?;

        Ok(BuildOutlineOutcome {
            volumes,
            stats: result.stats,
            raw: None,
            parse_failed: false,
        })
    }

    async fn world_context(&self, project_id: i64) -> String {
        let items = WorldItemRepository::new(&self.db.pool).list_for_project(project_id).await.unwrap_or_default();
        if items.is_empty() {
            return "(no world knowledge recorded yet)".to_string();
        }
        items.iter().map(|w| format!("{}: {}", w.name, w.description)).collect::<Vec<_>>().join("\n")
    }

    pub async fn detail_outline(&self, chapter_id: i64, provider: Option<&str>) -> Result<DetailOutlineOutcome> {
        let chapters_repo = ChapterRepository::new(&self.db.pool);
        let chapter = chapters_repo.get(chapter_id).await?;
        let volume = VolumeRepository::new(&self.db.pool).get(chapter.volume_id).await?;

        let key_events: Vec<String> = serde_json::from_str(&chapter.key_events).unwrap_or_default();
        let characters_involved: Vec<String> = serde_json::from_str(&chapter.characters_involved).unwrap_or_default();
        let world_context = self.world_context(volume.project_id).await;
        let previous_context = simple_recap(&self.db, chapter.volume_id, chapter.order, RECAP_WINDOW).await?;
        let summary = chapter.summary.clone().unwrap_or_default();

        let client = self.client(provider)?;
        let defaults = self.config.stage_defaults.detail_outline;
        let result = DetailOutlineGenerator::new()
            .generate(
                &*client,
                &self.ledger,
                &chapter.title,
                chapter.order,
                &summary,
                &key_events,
                &characters_involved,
                &world_context,
                &previous_context,
                defaults.temperature,
                defaults.max_tokens,
            )
            .await?;

        let persisted = match &result.draft {
            Some(draft) => serde_json::to_string(draft)?,
            None => result.raw_content.clone(),
        };
        chapters_repo.set_detail_outline(chapter_id, &persisted).await?;

        Ok(DetailOutlineOutcome {
            chapter_id,
            draft: result.draft,
            stats: result.stats,
            parse_failed: result.parse_failed,
        })
    }

    pub async fn batch_detail_outline(&self, project_id: i64, provider: Option<&str>) -> Result<Vec<TaskOutcome>> {
        let chapters = ChapterRepository::new(&self.db.pool).list_for_project(project_id).await?;
        let mut outcomes = Vec::with_capacity(chapters.len());
        for chapter in chapters {
            outcomes.push(self.run_detail_outline_task(&chapter, provider).await);
        }
        Ok(outcomes)
    }

    async fn run_detail_outline_task(&self, chapter: &Chapter, provider: Option<&str>) -> TaskOutcome {
        match self.detail_outline(chapter.id, provider).await {
            Ok(outcome) => TaskOutcome::success(chapter.id, &chapter.title, PipelineStage::DetailOutline, Some(outcome.stats)),
            Err(e) => TaskOutcome::failure(chapter.id, &chapter.title, PipelineStage::DetailOutline, e.to_string()),
        }
    }

    pub async fn write(
        &self,
        chapter_id: i64,
        style_guide: Option<&str>,
        author_note: Option<&str>,
        provider: Option<&str>,
    ) -> Result<WritingResult> {
        let chapters_repo = ChapterRepository::new(&self.db.pool);
        let chapter = chapters_repo.get(chapter_id).await?;
        let volume = VolumeRepository::new(&self.db.pool).get(chapter.volume_id).await?;

        let chapter_outline = chapter
            .detail_outline
            .clone()
            .filter(|o| !o.trim().is_empty())
            .ok_or_else(|| EngineError::insufficient_data(format!("chapter {chapter_id} has no detail outline to write from"), "chapter.detail_outline"))?;

        let style_guide = match style_guide {
            Some(guide) => guide.to_string(),
            None => StyleProfileRepository::new(&self.db.pool)
                .get_active(volume.project_id)
                .await?
                .map(|p| p.style_guide)
                .unwrap_or_default(),
        };

        let assembler = ContextAssembler::new(self.db.clone(), None);
        let scan_text = Some(chapter_outline.as_str());
        let bundle = assembler
            .build_bundle(
                volume.project_id,
                chapter.volume_id,
                chapter.order,
                RECAP_WINDOW,
                RECAP_TOKEN_BUDGET,
                scan_text,
                self.config.embedding_api_key.as_deref(),
                self.config.embedding_api_base.as_deref(),
                PLOT_ARC_TOP_K,
            )
            .await?;

        let client = self.client(provider)?;
        let defaults = self.config.stage_defaults.writing;
        let result = WritingGenerator::new()
            .generate(
                &*client,
                &self.ledger,
                &chapter.title,
                chapter.order,
                &chapter_outline,
                &bundle,
                &style_guide,
                author_note,
                defaults.temperature,
                defaults.max_tokens,
            )
            .await?;

        chapters_repo.set_content(chapter_id, &result.content, SummaryPolicy::Invalidate).await?;
        ProjectRepository::new(&self.db.pool).advance_stage(volume.project_id, ProjectStage::Writing).await?;

        Ok(result)
    }

    async fn run_write_task(&self, chapter: &Chapter, provider: Option<&str>) -> TaskOutcome {
        match self.write(chapter.id, None, None, provider).await {
            Ok(result) => TaskOutcome::success(chapter.id, &chapter.title, PipelineStage::Writing, Some(result.stats)),
            Err(e) => TaskOutcome::failure(chapter.id, &chapter.title, PipelineStage::Writing, e.to_string()),
        }
    }

    pub async fn quality_check(&self, chapter_id: i64, provider: Option<&str>) -> Result<QualityCheckResult> {
        let chapters_repo = ChapterRepository::new(&self.db.pool);
        let chapter = chapters_repo.get(chapter_id).await?;
        let volume = VolumeRepository::new(&self.db.pool).get(chapter.volume_id).await?;

        if !chapter.has_content() {
            return Err(EngineError::insufficient_data(format!("chapter {chapter_id} has no content yet"), "chapter.content"));
        }

        let characters = CharacterRepository::new(&self.db.pool).list_for_project(volume.project_id).await?;
        let scan = lorebook::scan(&characters, &[], &chapter.content, 0, 8);
        let character_cards_json = serde_json::to_string(&scan.character)?;
        let previous_context = simple_recap(&self.db, chapter.volume_id, chapter.order, RECAP_WINDOW).await?;
        let summary = chapter.summary.clone().unwrap_or_default();

        let client = self.client(provider)?;
        let defaults = self.config.stage_defaults.quality_check;
        let result = QualityCheckGenerator::new()
            .generate(
                &*client,
                &self.ledger,
                &chapter.title,
                chapter.order,
                &summary,
                &chapter.content,
                &character_cards_json,
                &previous_context,
                defaults.temperature,
                defaults.max_tokens,
            )
            .await?;

        chapters_repo.set_quality_report(chapter_id, &serde_json::to_string(&result.report)?).await?;
        ProjectRepository::new(&self.db.pool).advance_stage(volume.project_id, ProjectStage::QualityCheck).await?;

        Ok(result)
    }

    pub async fn batch_quality_check(&self, project_id: i64, provider: Option<&str>) -> Result<Vec<TaskOutcome>> {
        let chapters = ChapterRepository::new(&self.db.pool).list_for_project(project_id).await?;
        let mut outcomes = Vec::with_capacity(chapters.len());
        for chapter in chapters {
            let outcome = match self.quality_check(chapter.id, provider).await {
                Ok(result) => TaskOutcome::success(chapter.id, &chapter.title, PipelineStage::QualityCheck, Some(result.stats)),
                Err(e) => TaskOutcome::failure(chapter.id, &chapter.title, PipelineStage::QualityCheck, e.to_string()),
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn check_consistency(
        &self,
        chapter_id: i64,
        override_text: Option<&str>,
        strict: bool,
        provider: Option<&str>,
    ) -> Result<ConsistencyReport> {
        let chapters_repo = ChapterRepository::new(&self.db.pool);
        let chapter = chapters_repo.get(chapter_id).await?;
        let volume = VolumeRepository::new(&self.db.pool).get(chapter.volume_id).await?;

        let content_to_check = override_text.unwrap_or(&chapter.content);
        if content_to_check.trim().is_empty() {
            return Err(EngineError::insufficient_data(format!("chapter {chapter_id} has no content to check"), "chapter.content"));
        }

        let characters = CharacterRepository::new(&self.db.pool).list_for_project(volume.project_id).await?;
        let world_items = WorldItemRepository::new(&self.db.pool).list_for_project(volume.project_id).await?;
        let scan = lorebook::scan(&characters, &world_items, content_to_check, 8, 5);
        let character_cards_json = serde_json::to_string(&scan.character)?;
        let world_cards_json = serde_json::to_string(&scan.world)?;
        let previous_context = simple_recap(&self.db, chapter.volume_id, chapter.order, RECAP_WINDOW).await?;
        let summary = chapter.summary.clone().unwrap_or_default();

        let client = self.client(provider)?;
        let defaults = self.config.stage_defaults.consistency_check;
        ConsistencyCheckGenerator::new()
            .generate(
                &*client,
                &self.ledger,
                &chapter.title,
                chapter.order,
                &summary,
                content_to_check,
                &previous_context,
                &character_cards_json,
                &world_cards_json,
                strict,
                defaults.temperature,
                defaults.max_tokens,
            )
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn rewrite(
        &self,
        chapter_id: i64,
        instruction: &str,
        rewrite_mode: &str,
        scope: RewriteScope,
        range_start: Option<usize>,
        range_end: Option<usize>,
        preserve_plot: bool,
        save: bool,
        provider: Option<&str>,
    ) -> Result<RewriteOutcome> {
        let client = self.client(provider)?;
        let defaults = self.config.stage_defaults.rewrite;
        self.rewrite_service
            .rewrite(
                &*client,
                &self.ledger,
                chapter_id,
                instruction,
                rewrite_mode,
                scope,
                range_start,
                range_end,
                preserve_plot,
                save,
                defaults.temperature,
                defaults.max_tokens,
            )
            .await
    }

    /// Whether a rollback persists the restored content is left to the
    /// caller; absent an explicit choice this defaults to `true`; reverting
    /// is the whole point of calling rollback, and a caller who only wants
    /// to preview a prior version can pass `Some(false)`.
    pub async fn rollback(&self, chapter_id: i64, history_id: Option<&str>, save: Option<bool>) -> Result<RollbackOutcome> {
        self.rollback_service.rollback(chapter_id, history_id, save.unwrap_or(true)).await
    }

    pub async fn pipeline_status(&self, project_id: i64) -> Result<PipelineStatus> {
        let chapters = ChapterRepository::new(&self.db.pool).list_for_project(project_id).await?;
        let with_outline = chapters.iter().filter(|c| c.detail_outline.as_deref().is_some_and(|o| !o.is_empty())).count();
        let with_content = chapters.iter().filter(|c| c.has_content()).count();
        let missing_outline = chapters
            .iter()
            .filter(|c| !c.detail_outline.as_deref().is_some_and(|o| !o.is_empty()))
            .map(|c| c.id)
            .collect();
        let missing_content = chapters.iter().filter(|c| !c.has_content()).map(|c| c.id).collect();

        Ok(PipelineStatus {
            total_chapters: chapters.len(),
            with_outline,
            with_content,
            missing_outline,
            missing_content,
        })
    }

    pub async fn mark_complete(&self, project_id: i64) -> Result<()> {
        ProjectRepository::new(&self.db.pool).advance_stage(project_id, ProjectStage::Completed).await?;
        Ok(())
    }

    pub async fn run_pipeline(&self, project_id: i64, request: crate::pipeline_runner::BatchRequest) -> Result<crate::pipeline_runner::PipelineResult> {
        crate::pipeline_runner::run_pipeline(self, project_id, request).await
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Which pipeline stage a [`TaskOutcome`] reports on. Numbered to match the
/// `from_step`/`to_step` vocabulary used by batch requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineStage {
    Outline = 3,
    DetailOutline = 4,
    Writing = 5,
    QualityCheck = 6,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub chapter_id: i64,
    pub chapter_title: String,
    pub stage: PipelineStage,
    pub success: bool,
    pub skipped: bool,
    pub error: Option<String>,
    pub stats: Option<GenerationStats>,
}

impl TaskOutcome {
    fn success(chapter_id: i64, chapter_title: &str, stage: PipelineStage, stats: Option<GenerationStats>) -> Self {
        Self {
            chapter_id,
            chapter_title: chapter_title.to_string(),
            stage,
            success: true,
            skipped: false,
            error: None,
            stats,
        }
    }

    fn failure(chapter_id: i64, chapter_title: &str, stage: PipelineStage, error: String) -> Self {
        Self {
            chapter_id,
            chapter_title: chapter_title.to_string(),
            stage,
            success: false,
            skipped: false,
            error: Some(error),
            stats: None,
        }
    }

    pub(crate) fn skipped(chapter_id: i64, chapter_title: &str, stage: PipelineStage, reason: &str) -> Self {
        Self {
            chapter_id,
            chapter_title: chapter_title.to_string(),
            stage,
            success: false,
            skipped: true,
            error: Some(reason.to_string()),
            stats: None,
        }
    }
}

impl WorkflowOrchestrator {
    pub(crate) async fn dispatch_detail_outline(&self, chapter: &Chapter, provider: Option<&str>) -> TaskOutcome {
        self.run_detail_outline_task(chapter, provider).await
    }

    pub(crate) async fn dispatch_write(&self, chapter: &Chapter, provider: Option<&str>) -> TaskOutcome {
        self.run_write_task(chapter, provider).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use narrative_storage::db::connect;
    use narrative_storage::repository::{CharacterRepository, WorldItemRepository};

    use super::*;
    use crate::config::StageDefaults;
    use crate::providers::ProviderCredentials;
    use crate::stages::test_support::ScriptedClient;

    async fn setup() -> (WorkflowOrchestrator, i64, tempfile::TempDir) {
        let db = connect("sqlite::memory:", 4).await.unwrap();
        let project = ProjectRepository::new(&db.pool).create("Orbit of Ash", None, None).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut provider_credentials = HashMap::new();
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
            stage_defaults: StageDefaults::default(),
        };
        let orchestrator = WorkflowOrchestrator::new(db, config).unwrap();
        (orchestrator, project.id, dir)
    }

    #[tokio::test]
    async fn status_reports_stage_and_whether_the_project_can_continue() {
        let (orchestrator, project_id, _dir) = setup().await;
        let status = orchestrator.status(project_id).await.unwrap();
        assert_eq!(status.stage, "created");
        assert_eq!(status.current_step, 0);
        assert!(status.can_continue);

        ProjectRepository::new(&orchestrator.db().pool)
            .advance_stage(project_id, ProjectStage::Completed)
            .await
            .unwrap();
        let status = orchestrator.status(project_id).await.unwrap();
        assert!(!status.can_continue);
    }

    #[tokio::test]
    async fn plan_persists_planning_text_and_advances_the_stage() {
        let (orchestrator, project_id, _dir) = setup().await;
        let client = Arc::new(ScriptedClient::once("A lonely moon colony rebuilds after a reactor failure."));
        orchestrator.registry.insert_for_test("openai", "gpt-4o", client);

        let result = orchestrator.plan(project_id, Some("a moon colony rebuilds"), None).await.unwrap();
        assert!(!result.planning_text.is_empty());

        let project = ProjectRepository::new(&orchestrator.db().pool).get(project_id).await.unwrap();
        assert_eq!(project.planning_text.as_deref(), Some(result.planning_text.as_str()));
        assert!(project.current_step >= ProjectStage::Planning.rank());
    }

    #[tokio::test]
    async fn build_world_without_planning_text_is_insufficient_data() {
        let (orchestrator, project_id, _dir) = setup().await;
        let err = orchestrator.build_world(project_id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }

    #[tokio::test]
    async fn build_world_persists_entities_on_a_parseable_reply() {
        let (orchestrator, project_id, _dir) = setup().await;
        ProjectRepository::new(&orchestrator.db().pool).set_planning_text(project_id, "plan text").await.unwrap();

        let reply = r#"{"world_data": [{"data_type": "location", "name": "Ashfall Station", "description": "a crippled habitat ring", "properties": {}, "lorebook_keywords": ["Ashfall"]}], "characters": [{"name": "Mira Tran", "archetype": "engineer", "background": "raised on the ring", "goals": ["repair the reactor"], "lorebook_keywords": ["Mira"]}]}"#;
        let client = Arc::new(ScriptedClient::once(reply));
        orchestrator.registry.insert_for_test("openai", "gpt-4o", client);

        let outcome = orchestrator.build_world(project_id, None).await.unwrap();
        assert!(!outcome.parse_failed);
        assert_eq!(outcome.characters.len(), 1);
        assert_eq!(outcome.world_data.len(), 1);

        let stored_characters = CharacterRepository::new(&orchestrator.db().pool).list_for_project(project_id).await.unwrap();
        assert_eq!(stored_characters.len(), 1);
        let stored_world = WorldItemRepository::new(&orchestrator.db().pool).list_for_project(project_id).await.unwrap();
        assert_eq!(stored_world.len(), 1);

        let project = ProjectRepository::new(&orchestrator.db().pool).get(project_id).await.unwrap();
        assert!(project.current_step >= ProjectStage::WorldBuilding.rank());
    }

    #[tokio::test]
    async fn build_world_keeps_the_raw_reply_on_a_parse_failure() {
        let (orchestrator, project_id, _dir) = setup().await;
        ProjectRepository::new(&orchestrator.db().pool).set_planning_text(project_id, "plan text").await.unwrap();

        let client = Arc::new(ScriptedClient::once("not json at all"));
        orchestrator.registry.insert_for_test("openai", "gpt-4o", client);

        let outcome = orchestrator.build_world(project_id, None).await.unwrap();
        assert!(outcome.parse_failed);
        assert_eq!(outcome.raw.as_deref(), Some("not json at all"));
        assert!(outcome.characters.is_empty());

        let project = ProjectRepository::new(&orchestrator.db().pool).get(project_id).await.unwrap();
        assert_eq!(project.world_building_raw.as_deref(), Some("not json at all"));
    }

    #[tokio::test]
    async fn build_outline_without_characters_is_insufficient_data() {
        let (orchestrator, project_id, _dir) = setup().await;
        ProjectRepository::new(&orchestrator.db().pool).set_planning_text(project_id, "plan text").await.unwrap();
        let err = orchestrator.build_outline(project_id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }

    #[tokio::test]
    async fn build_outline_creates_volumes_and_chapters_on_a_parseable_reply() {
        let (orchestrator, project_id, _dir) = setup().await;
        ProjectRepository::new(&orchestrator.db().pool).set_planning_text(project_id, "plan text").await.unwrap();
        CharacterRepository::new(&orchestrator.db().pool).create(project_id, "Mira Tran", None, None).await.unwrap();

        let reply = r#"{"volumes": [{"title": "Book One", "order": 1, "description": "the reactor fails", "chapters": [{"title": "Cold Start", "order": 1, "summary": "the ring loses power", "key_events": ["power loss"], "characters_involved": ["Mira Tran"]}]}]}"#;
        let client = Arc::new(ScriptedClient::once(reply));
        orchestrator.registry.insert_for_test("openai", "gpt-4o", client);

        let outcome = orchestrator.build_outline(project_id, None).await.unwrap();
        assert!(!outcome.parse_failed);
        assert_eq!(outcome.volumes.len(), 1);

        let chapters = ChapterRepository::new(&orchestrator.db().pool).list_for_project(project_id).await.unwrap();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "Cold Start");

        let project = ProjectRepository::new(&orchestrator.db().pool).get(project_id).await.unwrap();
        assert!(project.current_step >= ProjectStage::Outline.rank());
    }

    async fn seed_single_chapter(orchestrator: &WorkflowOrchestrator, project_id: i64) -> i64 {
        CharacterRepository::new(&orchestrator.db().pool).create(project_id, "Mira Tran", None, None).await.unwrap();
        let volume = VolumeRepository::new(&orchestrator.db().pool).create(project_id, "Book One", 1, None).await.unwrap();
        let chapter = ChapterRepository::new(&orchestrator.db().pool)
            .create(volume.id, "Cold Start", 1, "", r#"["power loss"]"#, r#"["Mira Tran"]"#)
            .await
            .unwrap();
        chapter.id
    }

    #[tokio::test]
    async fn detail_outline_persists_raw_text_on_a_parse_failure() {
        let (orchestrator, project_id, _dir) = setup().await;
        let chapter_id = seed_single_chapter(&orchestrator, project_id).await;

        let client = Arc::new(ScriptedClient::once("not json at all"));
        orchestrator.registry.insert_for_test("openai", "gpt-4o", client);

        let outcome = orchestrator.detail_outline(chapter_id, None).await.unwrap();
        assert!(outcome.parse_failed);
        assert!(outcome.draft.is_none());

        let chapter = ChapterRepository::new(&orchestrator.db().pool).get(chapter_id).await.unwrap();
        assert_eq!(chapter.detail_outline.as_deref(), Some("not json at all"));
    }

    #[tokio::test]
    async fn write_without_a_detail_outline_is_insufficient_data() {
        let (orchestrator, project_id, _dir) = setup().await;
        let chapter_id = seed_single_chapter(&orchestrator, project_id).await;
        let err = orchestrator.write(chapter_id, None, None, None).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }

    #[tokio::test]
    async fn write_persists_content_and_advances_the_project() {
        let (orchestrator, project_id, _dir) = setup().await;
        let chapter_id = seed_single_chapter(&orchestrator, project_id).await;
        ChapterRepository::new(&orchestrator.db().pool).set_detail_outline(chapter_id, "an outline of beats").await.unwrap();

        let client = Arc::new(ScriptedClient::once("The reactor hummed its last warning before the lights failed."));
        orchestrator.registry.insert_for_test("openai", "gpt-4o", client);

        let result = orchestrator.write(chapter_id, Some("terse, present tense"), None, None).await.unwrap();
        assert!(!result.content.is_empty());

        let chapter = ChapterRepository::new(&orchestrator.db().pool).get(chapter_id).await.unwrap();
        assert_eq!(chapter.content, result.content);

        let project = ProjectRepository::new(&orchestrator.db().pool).get(project_id).await.unwrap();
        assert!(project.current_step >= ProjectStage::Writing.rank());
    }

    #[tokio::test]
    async fn quality_check_without_content_is_insufficient_data() {
        let (orchestrator, project_id, _dir) = setup().await;
        let chapter_id = seed_single_chapter(&orchestrator, project_id).await;
        let err = orchestrator.quality_check(chapter_id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }

    #[tokio::test]
    async fn quality_check_persists_the_report_and_advances_the_project() {
        let (orchestrator, project_id, _dir) = setup().await;
        let chapter_id = seed_single_chapter(&orchestrator, project_id).await;
        ChapterRepository::new(&orchestrator.db().pool)
            .set_content(chapter_id, "The reactor hummed its last warning.", SummaryPolicy::Invalidate)
            .await
            .unwrap();

        let reply = r#"{"overall_score": 8, "issues": [], "critical_issues": 0}"#;
        let client = Arc::new(ScriptedClient::once(reply));
        orchestrator.registry.insert_for_test("openai", "gpt-4o", client);

        let result = orchestrator.quality_check(chapter_id, None).await.unwrap();
        assert_eq!(result.issues_count, 0);

        let chapter = ChapterRepository::new(&orchestrator.db().pool).get(chapter_id).await.unwrap();
        assert!(chapter.quality_report.is_some());

        let project = ProjectRepository::new(&orchestrator.db().pool).get(project_id).await.unwrap();
        assert!(project.current_step >= ProjectStage::QualityCheck.rank());
    }

    #[tokio::test]
    async fn check_consistency_never_persists_anything() {
        let (orchestrator, project_id, _dir) = setup().await;
        let chapter_id = seed_single_chapter(&orchestrator, project_id).await;
        ChapterRepository::new(&orchestrator.db().pool)
            .set_content(chapter_id, "The reactor hummed its last warning.", SummaryPolicy::Invalidate)
            .await
            .unwrap();

        let reply = r#"{"overall_risk": "low", "summary": "no contradictions found", "issues": []}"#;
        let client = Arc::new(ScriptedClient::once(reply));
        orchestrator.registry.insert_for_test("openai", "gpt-4o", client);

        let before = ChapterRepository::new(&orchestrator.db().pool).get(chapter_id).await.unwrap();
        let report = orchestrator.check_consistency(chapter_id, None, false, None).await.unwrap();
        assert_eq!(report.overall_risk, "low");
        let after = ChapterRepository::new(&orchestrator.db().pool).get(chapter_id).await.unwrap();
        assert_eq!(before.updated_at, after.updated_at);
    }

    #[tokio::test]
    async fn rollback_defaults_to_saving_the_restored_content() {
        let (orchestrator, project_id, _dir) = setup().await;
        let chapter_id = seed_single_chapter(&orchestrator, project_id).await;
        ChapterRepository::new(&orchestrator.db().pool)
            .set_content(chapter_id, "first draft", SummaryPolicy::Invalidate)
            .await
            .unwrap();

        let client = Arc::new(ScriptedClient::once("a punchier rewrite of the opening line."));
        orchestrator.registry.insert_for_test("openai", "gpt-4o", client);
        orchestrator
            .rewrite(chapter_id, "make it punchier", "style", RewriteScope::Chapter, None, None, false, true, None)
            .await
            .unwrap();

        let outcome = orchestrator.rollback(chapter_id, None, None).await.unwrap();
        assert!(outcome.saved);
        assert_eq!(outcome.rolled_back_content, "first draft");

        let chapter = ChapterRepository::new(&orchestrator.db().pool).get(chapter_id).await.unwrap();
        assert_eq!(chapter.content, "first draft");
    }

    #[tokio::test]
    async fn pipeline_status_counts_outline_and_content_gaps() {
        let (orchestrator, project_id, _dir) = setup().await;
        seed_single_chapter(&orchestrator, project_id).await;

        let status = orchestrator.pipeline_status(project_id).await.unwrap();
        assert_eq!(status.total_chapters, 1);
        assert_eq!(status.with_outline, 0);
        assert_eq!(status.with_content, 0);
        assert_eq!(status.missing_outline.len(), 1);
        assert_eq!(status.missing_content.len(), 1);
    }

    #[tokio::test]
    async fn mark_complete_advances_the_project_to_completed() {
        let (orchestrator, project_id, _dir) = setup().await;
        orchestrator.mark_complete(project_id).await.unwrap();
        let status = orchestrator.status(project_id).await.unwrap();
        assert_eq!(status.stage, "completed");
        assert!(!status.can_continue);
    }

    #[tokio::test]
    async fn run_pipeline_delegates_to_the_pipeline_runner() {
        let (orchestrator, project_id, _dir) = setup().await;
        let err = orchestrator
            .run_pipeline(project_id, crate::pipeline_runner::BatchRequest { from_step: 1, to_step: 2, ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PipelineInvalidPlan(_)));
    }

}
