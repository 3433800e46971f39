//! # Heron Profiler
//!
//! Opcode histogram and sampling profiler for the Heron VM.
//!
//! The engine publishes where it is (CodeBlock, bytecode offset, opcode,
//! whether it is inside a runtime stub) into a [`ProfilerContext`] made of
//! atomics. A sampler thread reads that context at a fixed interval and never
//! writes engine state.

#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod report;
pub mod sampler;

pub use config::ProfilerConfig;
pub use context::ProfilerContext;
pub use report::{LineReport, OpcodeCount, OpcodeReport, ProfileReport};
pub use sampler::Profiler;
