//! Token/cost telemetry and budget enforcement
//!
//! The provider adapter reports request lifecycles directly:
//!
//! ```text
//! request_started(id, model)
//!     └─ stream_delta(id, n) ...   output tokens billed as they stream
//!         └─ request_finished(id, model, prompt, completion)
//!                                  prompt billed in full, completion reconciled
//! ```
//!
//! Every accounting call re-checks the [`RunBudget`]. The first violation emits
//! `run/budget-exceeded`, cancels the run and emits `run/stopped`; after that
//! the status never changes again.

mod accounting;
mod pricing;

pub use accounting::{BUDGET_EXCEEDED, ModelTotals, RunBudget, Telemetry, TelemetrySnapshot, TelemetryStatus};
pub use pricing::{PricingProvider, PricingTable, TokenPricing, round_usd, tokens_to_usd};
