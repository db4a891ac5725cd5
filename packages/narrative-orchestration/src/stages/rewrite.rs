//! Paragraph- or chapter-scoped rewriting, backed by an append-only
//! per-chapter rewrite-history file that [`super::rollback`] reads from.

use std::path::{Path, PathBuf};

use chrono::Utc;
use narrative_storage::repository::chapters::SummaryPolicy;
use narrative_storage::repository::ChapterRepository;
use narrative_storage::{Database, RewriteHistoryEntry};
use serde::Serialize;

use crate::cost_ledger::CostLedger;
use crate::error::{EngineError, Result};
use crate::providers::{GenerationClient, Message};
use crate::stages::{call_and_record, GenerationStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteScope {
    Paragraph,
    Chapter,
}

impl RewriteScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paragraph => "paragraph",
            Self::Chapter => "chapter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paragraph" => Some(Self::Paragraph),
            "chapter" => Some(Self::Chapter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RewriteOutcome {
    pub chapter_id: i64,
    pub original_content: String,
    pub new_content: String,
    pub diff_summary: String,
    pub history_id: String,
    pub saved: bool,
    pub stats: GenerationStats,
}

/// Splits on runs of two or more newlines, trimming and dropping empty
/// paragraphs.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut newline_run = 0;

    for ch in text.chars() {
        if ch == '\n' {
            newline_run += 1;
            if newline_run == 2 {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    paragraphs.push(trimmed.to_string());
                }
                current.clear();
            }
        } else {
            if newline_run == 1 {
                current.push('\n');
            }
            newline_run = 0;
            current.push(ch);
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        paragraphs.push(trimmed.to_string());
    }
    paragraphs
}

/// Longest-common-subsequence based similarity ratio between two texts, in
/// `[0.0, 1.0]`. `O(n*m)` time, `O(min(n, m))` memory.
fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    let mut prev = vec![0usize; short.len() + 1];
    let mut curr = vec![0usize; short.len() + 1];

    for &lc in long {
        for (j, &sc) in short.iter().enumerate() {
            curr[j + 1] = if lc == sc { prev[j] + 1 } else { prev[j + 1].max(curr[j]) };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs_len = prev[short.len()];
    (2.0 * lcs_len as f64) / (a.len() + b.len()) as f64
}

fn build_diff_summary(original: &str, rewritten: &str) -> String {
    let original_len = original.chars().count() as i64;
    let new_len = rewritten.chars().count() as i64;
    let ratio = similarity_ratio(original, rewritten);
    format!(
        "similarity: {:.1}%; original length: {original_len}; new length: {new_len}; change: {:+} characters",
        ratio * 100.0,
        new_len - original_len
    )
}

#[derive(Clone)]
pub struct RewriteService {
    db: Database,
    history_dir: PathBuf,
}

impl RewriteService {
    pub fn new(db: Database, history_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            history_dir: history_dir.into(),
        }
    }

    pub fn history_path(&self, chapter_id: i64) -> PathBuf {
        self.history_dir.join(format!("chapter_{chapter_id}_rewrite_history.jsonl"))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn rewrite(
        &self,
        llm: &dyn GenerationClient,
        ledger: &CostLedger,
        chapter_id: i64,
        instruction: &str,
        rewrite_mode: &str,
        scope: RewriteScope,
        range_start: Option<usize>,
        range_end: Option<usize>,
        preserve_plot: bool,
        save: bool,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<RewriteOutcome> {
        let chapters = ChapterRepository::new(&self.db.pool);
        let chapter = chapters.get(chapter_id).await?;
        if !chapter.has_content() {
            return Err(EngineError::insufficient_data(
                format!("chapter {chapter_id} has no content to rewrite"),
                "chapter.content",
            ));
        }
        if instruction.trim().is_empty() {
            return Err(EngineError::invalid_format("rewrite instruction must not be empty"));
        }

        let original_content = chapter.content.clone();

        let (new_content, stats) = match scope {
            RewriteScope::Chapter => {
                let rewritten = self
                    .rewrite_text(llm, ledger, &original_content, instruction, rewrite_mode, preserve_plot, temperature, max_tokens)
                    .await?;
                (rewritten.0, rewritten.1)
            }
            RewriteScope::Paragraph => {
                let mut paragraphs = split_paragraphs(&original_content);
                let start = range_start.unwrap_or(1);
                let end = range_end.unwrap_or(start);
                if start < 1 || end < start || end > paragraphs.len() {
                    return Err(EngineError::invalid_format(format!(
                        "paragraph range {start}-{end} is out of bounds for {} paragraphs",
                        paragraphs.len()
                    )));
                }

                let target = paragraphs[start - 1..end].join("\n\n");
                let (rewritten_target, stats) = self
                    .rewrite_text(llm, ledger, &target, instruction, rewrite_mode, preserve_plot, temperature, max_tokens)
                    .await?;

                let replacement = split_paragraphs(&rewritten_target);
                paragraphs.splice(start - 1..end, replacement);
                (paragraphs.join("\n\n"), stats)
            }
        };

        let diff_summary = build_diff_summary(&original_content, &new_content);
        let history_id = Utc::now().format("%Y%m%d%H%M%S%6f").to_string();

        self.append_history(
            &self.history_path(chapter_id),
            RewriteHistoryEntry {
                history_id: history_id.clone(),
                timestamp: Utc::now(),
                chapter_id,
                chapter_title: chapter.title.clone(),
                instruction: instruction.to_string(),
                rewrite_mode: rewrite_mode.to_string(),
                scope: scope.as_str().to_string(),
                original_content: original_content.clone(),
                new_content: new_content.clone(),
            },
        )?;

        if save {
            chapters.set_content(chapter_id, &new_content, SummaryPolicy::Invalidate).await?;
        }

        Ok(RewriteOutcome {
            chapter_id,
            original_content,
            new_content,
            diff_summary,
            history_id,
            saved: save,
            stats,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn rewrite_text(
        &self,
        llm: &dyn GenerationClient,
        ledger: &CostLedger,
        text: &str,
        instruction: &str,
        rewrite_mode: &str,
        preserve_plot: bool,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<(String, GenerationStats)> {
        let plot_clause = if preserve_plot {
            "Preserve all plot-relevant events and outcomes exactly; only change how they're told."
        } else {
            "You may adjust plot details if the instruction calls for it."
        };
        let prompt = format!(
            "Rewrite the following text per this instruction: {instruction}\n\
             Rewrite mode: {rewrite_mode}. {plot_clause}\n\n\
             Text:\n{text}\n\n\
             Respond with only the rewritten text."
        );
        let messages = [Message::user(prompt)];
        let result = call_and_record(llm, ledger, &messages, temperature, max_tokens, "rewrite").await?;

        let rewritten = result.text.trim().to_string();
        if rewritten.is_empty() {
            return Err(EngineError::invalid_format("rewrite produced empty text"));
        }
        Ok((rewritten, GenerationStats::from(&result)))
    }

    fn append_history(&self, path: &Path, entry: RewriteHistoryEntry) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&entry)?;
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_paragraphs_drops_empty_and_trims() {
        let text = "First.\n\n\nSecond.\n\n  Third.  \n\n";
        assert_eq!(split_paragraphs(text), vec!["First.", "Second.", "Third."]);
    }

    #[test]
    fn split_paragraphs_keeps_single_newlines_within_a_paragraph() {
        let text = "line one\nline two\n\nsecond paragraph";
        let paragraphs = split_paragraphs(text);
        assert_eq!(paragraphs.len(), 2);
        assert_eq!(paragraphs[0], "line one\nline two");
    }

    #[test]
    fn similarity_ratio_of_identical_text_is_one() {
        assert!((similarity_ratio("hello world", "hello world") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn similarity_ratio_of_unrelated_text_is_low() {
        assert!(similarity_ratio("abcdefgh", "zyxwvuts") < 0.2);
    }

    #[test]
    fn diff_summary_reports_lengths_and_change() {
        let summary = build_diff_summary("abc", "abcd");
        assert!(summary.contains("original length: 3"));
        assert!(summary.contains("new length: 4"));
        assert!(summary.contains("change: +1"));
    }
}
