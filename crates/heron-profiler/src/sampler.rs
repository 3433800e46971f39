//! Sampling thread and sample aggregation

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use heron_vm_bytecode::{OPCODE_COUNT, Opcode};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::ProfilerConfig;
use crate::context::{Position, ProfilerContext};
use crate::report::{LineReport, OpcodeCount, OpcodeReport, ProfileReport};

#[derive(Debug, Default)]
struct OpcodeSamples {
    samples: u64,
    in_helper: u64,
}

#[derive(Debug)]
pub(crate) struct SampleTable {
    total: u64,
    /// Samples that landed in a CodeBlock
    vm: u64,
    /// Samples in native code with no opcode published
    native: u64,
    opcodes: [OpcodeSamples; OPCODE_COUNT],
    offsets: FxHashMap<(u32, u32), u64>,
}

impl Default for SampleTable {
    fn default() -> Self {
        Self {
            total: 0,
            vm: 0,
            native: 0,
            opcodes: std::array::from_fn(|_| OpcodeSamples::default()),
            offsets: FxHashMap::default(),
        }
    }
}

impl SampleTable {
    fn record(&mut self, pos: Position) {
        self.total += 1;
        if pos.code_block == ProfilerContext::NO_CODE_BLOCK {
            return;
        }
        self.vm += 1;
        match pos.opcode {
            Some(opcode) => {
                let entry = &mut self.opcodes[opcode as usize];
                entry.samples += 1;
                if pos.in_helper {
                    entry.in_helper += 1;
                }
                *self.offsets.entry((pos.code_block, pos.offset)).or_default() += 1;
            }
            None => self.native += 1,
        }
    }
}

/// Sampling profiler.
///
/// [`Profiler::start`] spawns the sampler thread when sampling is enabled.
/// The thread is stopped and joined by [`Profiler::stop`] or on drop.
pub struct Profiler {
    config: ProfilerConfig,
    context: Arc<ProfilerContext>,
    samples: Arc<Mutex<SampleTable>>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: Instant,
}

impl Profiler {
    pub fn start(config: ProfilerConfig) -> Self {
        let context = Arc::new(ProfilerContext::new(config.histogram));
        let samples = Arc::new(Mutex::new(SampleTable::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = config.sampling.then(|| {
            let context = Arc::clone(&context);
            let samples = Arc::clone(&samples);
            let stop = Arc::clone(&stop);
            let interval = config.sample_interval();
            std::thread::Builder::new()
                .name("heron-sampler".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(interval);
                        let pos = context.read();
                        samples.lock().record(pos);
                    }
                })
        });
        let thread = match thread {
            Some(Ok(handle)) => Some(handle),
            Some(Err(err)) => {
                tracing::debug!(error = %err, "sampler thread failed to start");
                None
            }
            None => None,
        };

        Self {
            config,
            context,
            samples,
            stop,
            thread: Mutex::new(thread),
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Context the engine publishes into
    pub fn context(&self) -> Arc<ProfilerContext> {
        Arc::clone(&self.context)
    }

    /// Name a CodeBlock id and give its line table
    pub fn register_code_block(&self, id: u32, name: &str, lines: &[(u32, u32)]) {
        self.context.register_code_block(id, name, lines);
    }

    /// Take one sample on the calling thread
    pub fn sample_now(&self) {
        let pos = self.context.read();
        self.samples.lock().record(pos);
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Stop and join the sampler thread. Later calls do nothing.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.lock().take()
            && handle.join().is_err()
        {
            tracing::debug!("sampler thread panicked");
        }
    }

    pub fn report(&self) -> ProfileReport {
        let samples = self.samples.lock();
        let total = samples.total;
        let vm = samples.vm;
        let percent = |n: u64, of: u64| if of == 0 { 0.0 } else { n as f64 * 100.0 / of as f64 };

        let mut opcodes: Vec<OpcodeReport> = samples
            .opcodes
            .iter()
            .enumerate()
            .filter(|(_, s)| s.samples > 0)
            .filter_map(|(id, s)| {
                let opcode = Opcode::from_u8(id as u8)?;
                Some(OpcodeReport {
                    name: opcode.name().to_string(),
                    samples: s.samples,
                    percent_vm: percent(s.samples, vm),
                    percent_total: percent(s.samples, total),
                    in_helper: s.in_helper,
                    percent_self: percent(s.samples - s.in_helper, s.samples),
                })
            })
            .collect();
        opcodes.sort_by(|a, b| b.samples.cmp(&a.samples).then_with(|| a.name.cmp(&b.name)));

        let code_blocks = self.context.code_blocks.lock();
        let mut per_line: FxHashMap<(u32, Option<u32>), u64> = FxHashMap::default();
        for (&(cb, offset), &count) in &samples.offsets {
            let line = code_blocks.get(&cb).and_then(|info| info.line_for(offset));
            *per_line.entry((cb, line)).or_default() += count;
        }
        let mut lines: Vec<LineReport> = per_line
            .into_iter()
            .map(|((cb, line), samples)| LineReport {
                code_block: code_blocks
                    .get(&cb)
                    .map(|info| info.name.clone())
                    .unwrap_or_else(|| format!("#{cb}")),
                line,
                samples,
            })
            .collect();
        lines.sort_by(|a, b| {
            b.samples
                .cmp(&a.samples)
                .then_with(|| a.code_block.cmp(&b.code_block))
                .then_with(|| a.line.cmp(&b.line))
        });

        let histogram = self
            .context
            .histogram()
            .into_iter()
            .map(|(opcode, count)| OpcodeCount {
                name: opcode.name().to_string(),
                count,
            })
            .collect();

        ProfileReport {
            duration_us: self.started.elapsed().as_micros() as u64,
            total_samples: total,
            vm_samples: vm,
            native_samples: samples.native,
            opcodes,
            lines,
            histogram,
        }
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual() -> Profiler {
        Profiler::start(ProfilerConfig::default().with_sampling(false))
    }

    #[test]
    fn manual_samples_aggregate_by_opcode_and_line() {
        let profiler = manual();
        profiler.register_code_block(0, "main", &[(0, 1), (5, 2)]);
        let ctx = profiler.context();

        ctx.publish(0, 0, Opcode::Add);
        profiler.sample_now();
        profiler.sample_now();
        ctx.publish(0, 7, Opcode::GetById);
        ctx.set_in_helper(true);
        profiler.sample_now();
        ctx.set_in_helper(false);
        ctx.publish_idle();
        profiler.sample_now();

        let report = profiler.report();
        assert_eq!(report.total_samples, 4);
        assert_eq!(report.vm_samples, 3);
        assert_eq!(report.opcodes[0].name, "add");
        assert_eq!(report.opcodes[0].samples, 2);
        let get = &report.opcodes[1];
        assert_eq!((get.name.as_str(), get.in_helper), ("get_by_id", 1));
        assert_eq!(get.percent_self, 0.0);
        assert_eq!(report.lines[0].line, Some(1));
        assert_eq!(report.lines[1].line, Some(2));
        assert_eq!(report.lines[0].code_block, "main");
    }

    #[test]
    fn sampler_thread_stops_on_request() {
        let profiler = Profiler::start(
            ProfilerConfig::default().with_sample_interval(std::time::Duration::from_micros(50)),
        );
        assert!(profiler.is_running());
        profiler.context().publish(1, 0, Opcode::LoopHint);
        std::thread::sleep(std::time::Duration::from_millis(5));
        profiler.stop();
        assert!(!profiler.is_running());
        let after_stop = profiler.report().total_samples;
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(profiler.report().total_samples, after_stop);
    }
}
