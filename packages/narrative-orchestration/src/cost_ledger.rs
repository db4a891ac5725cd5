//! Daily-budget enforcement over an append-only, file-backed ledger.
//!
//! Guarded by a single mutex so the budget check and the append it gates are
//! one critical section — the same pattern the teacher's checkpoint manager
//! used for its in-memory `Vec`, applied here to a file-backed document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerCall {
    pub timestamp: chrono::DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
    pub task_tag: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DayAggregate {
    pub total_cost: f64,
    pub total_tokens: i64,
    pub call_count: i64,
    pub calls: Vec<LedgerCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayStatistic {
    pub date: String,
    pub total_cost: f64,
    pub total_tokens: i64,
    pub call_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStatistics {
    pub daily_budget: f64,
    pub today_total: f64,
    pub today_remaining: f64,
    pub days: Vec<DayStatistic>,
}

type LedgerDocument = BTreeMap<String, DayAggregate>;

struct LedgerState {
    document: LedgerDocument,
    daily_budget: f64,
}

pub struct CostLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl CostLedger {
    pub fn open(path: impl AsRef<Path>, daily_budget: f64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let document = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                LedgerDocument::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            LedgerDocument::new()
        };

        Ok(Self {
            path,
            state: Mutex::new(LedgerState {
                document,
                daily_budget,
            }),
        })
    }

    fn today_key() -> String {
        Utc::now().with_timezone(&chrono::Local).date_naive().to_string()
    }

    /// `today_total + projected_cost <= daily_budget`.
    pub fn check_budget(&self, projected_cost: f64) -> bool {
        let state = self.state.lock();
        let today_total = state
            .document
            .get(&Self::today_key())
            .map(|d| d.total_cost)
            .unwrap_or(0.0);
        today_total + projected_cost <= state.daily_budget
    }

    /// Appends an entry. The budget check and the append happen inside the
    /// same lock so a racing writer cannot slip a call in between.
    pub fn add(
        &self,
        cost: f64,
        input_tokens: i64,
        output_tokens: i64,
        provider: &str,
        model: &str,
        task_tag: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let key = Self::today_key();
        let today_total = state.document.get(&key).map(|d| d.total_cost).unwrap_or(0.0);

        if today_total + cost > state.daily_budget {
            return Err(EngineError::BudgetExceeded {
                today_total,
                daily_budget: state.daily_budget,
            });
        }

        let entry = LedgerCall {
            timestamp: Utc::now(),
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost,
            task_tag: task_tag.to_string(),
        };

        let day = state.document.entry(key).or_default();
        day.total_cost += cost;
        day.total_tokens += input_tokens + output_tokens;
        day.call_count += 1;
        day.calls.push(entry);

        self.write_atomically(&state.document)
    }

    pub fn statistics(&self, days: u32) -> LedgerStatistics {
        let state = self.state.lock();
        let today_key = Self::today_key();
        let today_total = state
            .document
            .get(&today_key)
            .map(|d| d.total_cost)
            .unwrap_or(0.0);

        let mut all_days: Vec<DayStatistic> = state
            .document
            .iter()
            .map(|(date, agg)| DayStatistic {
                date: date.clone(),
                total_cost: agg.total_cost,
                total_tokens: agg.total_tokens,
                call_count: agg.call_count,
            })
            .collect();
        all_days.sort_by(|a, b| b.date.cmp(&a.date));
        all_days.truncate(days as usize);

        LedgerStatistics {
            daily_budget: state.daily_budget,
            today_total,
            today_remaining: (state.daily_budget - today_total).max(0.0),
            days: all_days,
        }
    }

    pub fn reset_budget(&self, new_value: f64) -> Result<()> {
        if new_value <= 0.0 {
            return Err(EngineError::invalid_format("daily budget must be positive"));
        }
        self.state.lock().daily_budget = new_value;
        Ok(())
    }

    fn write_atomically(&self, document: &LedgerDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(document)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            warn!(error = %e, "cost ledger rename failed");
            e
        })?;
        Ok(())
    }
}
