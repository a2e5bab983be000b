//! Generate, render and score loop that drives a vision model toward
//! reproducing a target image as a P5.js sketch.

pub mod codex;
pub mod color;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod orchestrator;
pub mod overlay;
pub mod persist;
pub mod pixel_score;
pub mod regions;
pub mod render;
pub mod repair;
pub mod retry;
pub mod scorer;
pub mod session;
pub mod store;
pub mod target;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;
