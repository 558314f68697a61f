//! Property-based tests for the quality heuristics.
//!
//! Scores must be a pure function of the artifact and task type, and must
//! stay within 0-100 whatever the input.
