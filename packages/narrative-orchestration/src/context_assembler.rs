//! Layered compression of prior chapters, and assembly of the full context
//! bundle a generation stage needs: recap text, lorebook cards, and
//! foreshadowing cards.

use std::sync::Arc;

use narrative_storage::repository::{CharacterRepository, ChapterRepository, WorldItemRepository};
use narrative_storage::{Chapter, Database};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::lorebook::{self, LorebookScan};
use crate::plot_arc::{ArcCard, RagRetriever};
use crate::providers::{GenerationClient, Message};

const NEAR_THRESHOLD: i64 = 3;
const MID_THRESHOLD: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompressionLevel {
    Detailed,
    Brief,
    Minimal,
}

struct LevelConfig {
    target_words: usize,
    max_tokens: u32,
}

fn level_config(level: CompressionLevel) -> LevelConfig {
    match level {
        CompressionLevel::Detailed => LevelConfig {
            target_words: 200,
            max_tokens: 300,
        },
        CompressionLevel::Brief => LevelConfig {
            target_words: 100,
            max_tokens: 150,
        },
        CompressionLevel::Minimal => LevelConfig {
            target_words: 50,
            max_tokens: 80,
        },
    }
}

fn compression_level(distance: i64) -> CompressionLevel {
    if distance <= NEAR_THRESHOLD {
        CompressionLevel::Detailed
    } else if distance <= MID_THRESHOLD {
        CompressionLevel::Brief
    } else {
        CompressionLevel::Minimal
    }
}

const NO_PRIOR_CHAPTERS: &str = "This is the opening chapter; there is no prior context.";

#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub previous_context: String,
    pub character_memory_cards: Vec<lorebook::CharacterHit>,
    pub world_memory_cards: Vec<lorebook::WorldItemHit>,
    pub plot_arc_cards: Vec<ArcCard>,
}

pub struct ContextAssembler {
    db: Database,
    llm: Option<Arc<dyn GenerationClient>>,
}

impl ContextAssembler {
    pub fn new(db: Database, llm: Option<Arc<dyn GenerationClient>>) -> Self {
        Self { db, llm }
    }

    /// Builds the recap string for `current_order` within `volume_id`,
    /// walking back at most `window_size` chapters and spending at most
    /// `token_budget` tokens (char budget = token_budget * 1.5, since the
    /// target prose is Chinese-heavy and token-per-character is higher than
    /// for English).
    pub async fn build_recap(&self, volume_id: i64, current_order: i64, window_size: i64, token_budget: i64) -> Result<String> {
        if current_order <= 1 {
            return Ok(NO_PRIOR_CHAPTERS.to_string());
        }

        let chapters_repo = ChapterRepository::new(&self.db.pool);
        let start_order = (current_order - window_size).max(1);

        let mut chapters_with_distance = Vec::new();
        for order in start_order..current_order {
            if let Ok(chapter) = chapters_repo.get_by_order(volume_id, order).await {
                if chapter.has_content() {
                    let distance = current_order - chapter.order;
                    chapters_with_distance.push((chapter, distance));
                }
            }
        }

        if chapters_with_distance.is_empty() {
            return Ok(NO_PRIOR_CHAPTERS.to_string());
        }

        let fragments = self.compress_chapters(chapters_with_distance, token_budget).await;
        Ok(fragments.join("\n\n"))
    }

    /// Compresses each chapter nearest-first, stopping once the char budget
    /// runs out or downgrading to `Minimal` when the remaining budget can't
    /// afford the chapter's natural tier. Output is re-sorted by chapter
    /// order before returning.
    async fn compress_chapters(&self, mut chapters_with_distance: Vec<(Chapter, i64)>, token_budget: i64) -> Vec<String> {
        chapters_with_distance.sort_by_key(|(_, distance)| *distance);

        let char_budget = (token_budget as f64 * 1.5) as i64;
        let mut remaining = char_budget;
        let mut by_order: Vec<(i64, String)> = Vec::new();

        for (chapter, distance) in chapters_with_distance {
            if remaining <= 0 {
                break;
            }

            let mut level = compression_level(distance);
            let target = level_config(level).target_words as i64;

            if remaining < target {
                let minimal_target = level_config(CompressionLevel::Minimal).target_words as i64;
                if remaining >= minimal_target {
                    level = CompressionLevel::Minimal;
                } else {
                    break;
                }
            }

            let mut text = self.get_or_compress(&chapter, level).await;
            if text.chars().count() as i64 > remaining {
                let truncated: String = text.chars().take(remaining.max(0) as usize).collect();
                text = format!("{truncated}…");
            }

            remaining -= text.chars().count() as i64;
            let fragment = format!("Chapter {} {}: {}", chapter.order, chapter.title, text);
            by_order.push((chapter.order, fragment));
        }

        by_order.sort_by_key(|(order, _)| *order);
        by_order.into_iter().map(|(_, text)| text).collect()
    }

    async fn get_or_compress(&self, chapter: &Chapter, level: CompressionLevel) -> String {
        let target = level_config(level).target_words;

        if let Some(cached) = &chapter.summary {
            let cached_len = cached.chars().count();
            if cached_len as f64 <= target as f64 * 1.5 {
                return cached.clone();
            }
            let truncated: String = cached.chars().take(target).collect();
            return format!("{truncated}…");
        }

        self.compress_single(&chapter.content, level).await
    }

    async fn compress_single(&self, content: &str, level: CompressionLevel) -> String {
        let config = level_config(level);
        if content.chars().count() <= config.target_words {
            return content.to_string();
        }

        let Some(llm) = &self.llm else {
            return hard_truncate(content, config.target_words);
        };

        let prompt = format!(
            "Summarize the following chapter text in about {} words, preserving key plot points and character actions:\n\n{}",
            config.target_words, content
        );

        match llm.generate(&[Message::user(prompt)], 0.3, config.max_tokens).await {
            Ok(result) => result.text.trim().to_string(),
            Err(e) => {
                warn!(error = %e, "chapter compression call failed, falling back to hard truncation");
                hard_truncate(content, config.target_words)
            }
        }
    }

    /// Compresses a single chapter and persists the result to
    /// `chapter.summary`. If a summary is already cached, returns it without
    /// calling the LLM again.
    pub async fn compress_and_cache(&self, chapter_id: i64) -> Result<String> {
        let chapters_repo = ChapterRepository::new(&self.db.pool);
        let chapter = chapters_repo.get(chapter_id).await?;

        if let Some(summary) = &chapter.summary {
            debug!(chapter_id, "using cached chapter summary");
            return Ok(summary.clone());
        }

        let summary = self.compress_single(&chapter.content, CompressionLevel::Detailed).await;
        chapters_repo.set_summary(chapter_id, &summary).await?;
        Ok(summary)
    }

    /// Assembles the full four-part context bundle a generation stage needs.
    /// When `scan_text` is given, lorebook cards and plot-arc cards are
    /// scoped by keyword match / semantic similarity to it; otherwise this
    /// falls back to returning a bounded slice of everything available.
    /// Retrieval never hard-fails the bundle — a failure there is logged and
    /// the corresponding card list comes back empty.
    #[allow(clippy::too_many_arguments)]
    pub async fn build_bundle(
        &self,
        project_id: i64,
        volume_id: i64,
        current_order: i64,
        window_size: i64,
        token_budget: i64,
        scan_text: Option<&str>,
        embedding_api_key: Option<&str>,
        embedding_api_base: Option<&str>,
        plot_arc_top_k: usize,
    ) -> Result<ContextBundle> {
        let previous_context = self.build_recap(volume_id, current_order, window_size, token_budget).await?;

        let (character_memory_cards, world_memory_cards) = match scan_text {
            Some(text) => {
                let characters_repo = CharacterRepository::new(&self.db.pool);
                let world_repo = WorldItemRepository::new(&self.db.pool);
                let characters = characters_repo.list_for_project(project_id).await.unwrap_or_default();
                let world_items = world_repo.list_for_project(project_id).await.unwrap_or_default();
                let LorebookScan { world, character } = lorebook::scan(&characters, &world_items, text, 8, 5);
                (character, world)
            }
            None => {
                let characters_repo = CharacterRepository::new(&self.db.pool);
                let world_repo = WorldItemRepository::new(&self.db.pool);
                let characters = characters_repo.list_for_project(project_id).await.unwrap_or_default();
                let world_items = world_repo.list_for_project(project_id).await.unwrap_or_default();
                let LorebookScan { world, character } = lorebook::full_slice(&characters, &world_items, 8, 5);
                (character, world)
            }
        };

        let plot_arc_cards = match self.retrieve_plot_arcs(project_id, scan_text, embedding_api_key, embedding_api_base, plot_arc_top_k).await {
            Ok(cards) => cards,
            Err(e) => {
                warn!(error = %e, "plot arc retrieval failed, continuing without foreshadowing cards");
                Vec::new()
            }
        };

        Ok(ContextBundle {
            previous_context,
            character_memory_cards,
            world_memory_cards,
            plot_arc_cards,
        })
    }

    /// With scan text, retrieves arcs semantically related to it. Without
    /// any (e.g. the opening chapter, with nothing yet written to scan),
    /// falls back to the most important active arcs rather than running a
    /// retrieval against an empty query.
    async fn retrieve_plot_arcs(
        &self,
        project_id: i64,
        scan_text: Option<&str>,
        embedding_api_key: Option<&str>,
        embedding_api_base: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<ArcCard>> {
        match scan_text {
            Some(text) => {
                let retriever = RagRetriever::new(self.db.clone(), embedding_api_key, embedding_api_base);
                retriever.retrieve(project_id, text, top_k, true, 0.0).await
            }
            None => crate::plot_arc::top_active_by_importance(&self.db, project_id, top_k).await,
        }
    }
}

fn hard_truncate(content: &str, target_words: usize) -> String {
    let truncated: String = content.chars().take(target_words).collect();
    format!("{truncated}…")
}
