//! SpikeAgent curation engine.
//!
//! Vision-language-model ensemble that curates sorted spike units
//! (Good/Bad by 3-reviewer vote) and reviews merge candidates.

pub mod config;
pub mod curation;
pub mod providers;
