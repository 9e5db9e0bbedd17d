//! Ghost-trip detection.
//!
//! Unified tables are split into a clean table and a ghost audit table. A
//! flagged record never reaches the clean side, and nothing is discarded.

pub mod detect;
pub mod rules;

pub use detect::{DetectionReport, FlagStats, GhostPatterns, analyze_ghost_patterns, clean_all};
pub use rules::GhostRule;
