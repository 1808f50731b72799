mod config;
mod error;
mod ledger;
mod monitor;
mod policy;
mod proc;
mod quota;
mod runtime;
mod sandbox;
mod supervisor;
mod sync;
mod toolchain;
mod types;

pub use config::{EngineConfig, LimitsConfig, SecurityConfig};
pub use error::{EngineError, Result};
pub use ledger::ExecutionLedger;
pub use policy::PolicyGate;
pub use quota::QuotaTracker;
pub use runtime::Engine;
pub use sandbox::SandboxSpec;
pub use supervisor::ProcessSupervisor;
pub use toolchain::{LanguageSpec, ResolvedToolchain, Toolchain, default_languages};
pub use types::{
    JobLimits, JobRecord, JobState, LogChunk, ResourceSample, StatScope, Statistics, StopReason,
    Submission, TransitionEvent, UserId, UserRecord,
};
