// Pipeline orchestration layer

pub mod control;   // Cancellation flag and pause gate
pub mod merger;    // Chunk-group reassembly for the quota backend
pub mod pool;      // Bounded synthesis/transcription worker pool
pub mod progress;  // Per-step, per-language progress tracking
pub mod submitter; // Rate-limited submit-then-poll management
pub mod workflow;  // Staged top-level orchestrator

pub use control::{CancelFlag, PauseGate};
pub use progress::ProgressTracker;
pub use workflow::{ProviderSet, WorkflowManager};
