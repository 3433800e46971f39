//! Heron CLI - runs built-in workloads on the Heron VM.
//!
//! ```text
//! heron --workload fib --arg 30
//! heron --workload polymorphic --no-jit --profile
//! RUST_LOG=heron_vm_core=debug heron --workload loop-sum --json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use heron_profiler::{Profiler, ProfilerConfig};
use heron_vm_core::{Encoding, Engine, EngineConfig, Value, VmError};
use heron_vm_jit::SlowPathReason;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::filter::EnvFilter;

mod workloads;

use workloads::Workload;

#[derive(Parser)]
#[command(
    name = "heron",
    version,
    about = "Run bytecode workloads on the Heron VM",
    long_about = "Heron runs register bytecode in an interpreter and a Cranelift baseline JIT.\n\n\
                  Run a workload:   heron --workload fib --arg 30\n\
                  Interpreter only: heron --workload loop-sum --no-jit"
)]
struct Cli {
    /// Program to run
    #[arg(short, long, value_enum, default_value = "fib")]
    workload: Workload,

    /// Workload size (defaults per workload)
    #[arg(short, long)]
    arg: Option<i32>,

    /// Number of times to run the entry point
    #[arg(long, default_value = "1")]
    iterations: u32,

    /// Value encoding (nan-box or tag-payload)
    #[arg(long)]
    encoding: Option<Encoding>,

    /// Interpret only
    #[arg(long)]
    no_jit: bool,

    /// Executions before a CodeBlock is compiled
    #[arg(long)]
    jit_threshold: Option<u32>,

    /// Sample execution and print a profile
    #[arg(long)]
    profile: bool,

    /// Profiler sampling interval in microseconds
    #[arg(long, default_value = "1000")]
    sample_interval: u64,

    /// Print results, counters and profile as JSON
    #[arg(long)]
    json: bool,

    /// Disassemble installed CodeBlocks before running
    #[arg(long)]
    dump: bool,

    /// Engine configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                EngineConfig::from_json(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => EngineConfig::default(),
        };
        if let Some(encoding) = self.encoding {
            config = config.with_encoding(encoding);
        }
        if self.no_jit {
            config = config.with_jit(false);
        }
        if let Some(threshold) = self.jit_threshold {
            config = config.with_jit_threshold(threshold);
        }
        if self.profile {
            config = config.with_opcode_histogram(true);
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.engine_config()?;
    tracing::debug!(?config, workload = cli.workload.name(), "starting");

    let profiler = cli.profile.then(|| {
        Profiler::start(
            ProfilerConfig::default()
                .with_histogram(true)
                .with_sample_interval(Duration::from_micros(cli.sample_interval)),
        )
    });
    let mut engine = match &profiler {
        Some(profiler) => Engine::with_profiler(config, profiler),
        None => Engine::new(config),
    };

    let arg = cli.arg.unwrap_or_else(|| cli.workload.default_arg());
    let prepared = cli.workload.prepare(&mut engine, arg)?;

    if cli.dump {
        for code in engine.code_blocks() {
            println!("{}", code.code.disassemble());
        }
    }

    let started = Instant::now();
    let mut result = Value::Undefined;
    for _ in 0..cli.iterations.max(1) {
        result = match engine.execute(&prepared.entry, Value::Undefined, &prepared.args) {
            Ok(value) => value,
            Err(err) => {
                report_uncaught(&err);
                return Err(err.into());
            }
        };
    }
    let elapsed = started.elapsed();

    if let Some(profiler) = &profiler {
        profiler.stop();
    }

    let rendered = engine.display(result);
    if cli.json {
        let mut out = serde_json::json!({
            "workload": cli.workload.name(),
            "arg": arg,
            "iterations": cli.iterations.max(1),
            "encoding": engine.encoding().to_string(),
            "result": rendered,
            "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
            "stats": serde_json::to_value(engine.stats())?,
            "jit": jit_json(&engine),
        });
        if let Some(profiler) = &profiler {
            out["profile"] = profiler.report().to_json();
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{rendered}");
        eprintln!(
            "{} ({arg}) x{} in {:.3} ms [{}{}]",
            cli.workload.name(),
            cli.iterations.max(1),
            elapsed.as_secs_f64() * 1000.0,
            engine.encoding(),
            if engine.jit_enabled() { ", baseline" } else { "" },
        );
        if let Some(profiler) = &profiler {
            eprintln!("{}", profiler.report().to_text());
        }
    }
    Ok(())
}

fn jit_json(engine: &Engine) -> serde_json::Value {
    let Some(stats) = engine.jit_stats() else {
        return serde_json::Value::Null;
    };
    let slow_paths: serde_json::Map<String, serde_json::Value> = SlowPathReason::ALL
        .iter()
        .map(|&reason| (reason.name().to_string(), stats.slow_path_count(reason).into()))
        .collect();
    serde_json::json!({
        "compiled": stats.compiled,
        "failed": stats.failed,
        "stub_routines": stats.stub_routines,
        "slow_paths": slow_paths,
    })
}

fn report_uncaught(err: &VmError) {
    if let VmError::Exception(thrown) = err {
        for frame in &thrown.stack {
            match frame.line {
                Some(line) => eprintln!("    at {} (line {line}, {:?})", frame.function, frame.tier),
                None => eprintln!(
                    "    at {} (offset {}, {:?})",
                    frame.function, frame.bytecode_offset, frame.tier
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_defaults() {
        let cli = Cli::parse_from([
            "heron",
            "--workload",
            "loop-sum",
            "--encoding",
            "tag-payload",
            "--no-jit",
            "--jit-threshold",
            "7",
        ]);
        let config = cli.engine_config().unwrap();
        assert_eq!(cli.workload, Workload::LoopSum);
        assert_eq!(config.encoding, Encoding::TagPayload);
        assert!(!config.jit_enabled);
        assert_eq!(config.jit_threshold, 7);
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        assert!(Cli::try_parse_from(["heron", "--encoding", "boxed"]).is_err());
    }
}
