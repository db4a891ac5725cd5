//! Generation orchestration for the narrative engine: provider clients,
//! cost ledgering, lorebook and plot-arc retrieval, context assembly, the
//! per-stage generators, and the workflow/pipeline entry points that tie
//! them to persistence.

pub mod config;
pub mod context_assembler;
pub mod cost_ledger;
pub mod error;
pub mod lorebook;
pub mod parsing;
pub mod pipeline_runner;
pub mod plot_arc;
pub mod providers;
pub mod stages;
pub mod workflow_orchestrator;

pub use config::EngineConfig;
pub use context_assembler::{ContextAssembler, ContextBundle};
pub use cost_ledger::CostLedger;
pub use error::{EngineError, Result};
pub use pipeline_runner::{run_pipeline, BatchRequest, PipelineResult};
pub use providers::{GenerationClient, ProviderCredentials, ProviderRegistry};
pub use workflow_orchestrator::{PipelineStage, TaskOutcome, WorkflowOrchestrator};
