//! Profile reports

use std::fmt::Write as _;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct OpcodeReport {
    pub name: String,
    pub samples: u64,
    /// Share of samples that landed in a CodeBlock
    pub percent_vm: f64,
    /// Share of all samples
    pub percent_total: f64,
    /// Samples taken while a runtime stub was running for this opcode
    pub in_helper: u64,
    /// Share of this opcode's samples outside runtime stubs
    pub percent_self: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineReport {
    pub code_block: String,
    pub line: Option<u32>,
    pub samples: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpcodeCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileReport {
    pub duration_us: u64,
    pub total_samples: u64,
    pub vm_samples: u64,
    /// VM samples in compiled code between stub calls
    pub native_samples: u64,
    pub opcodes: Vec<OpcodeReport>,
    pub lines: Vec<LineReport>,
    pub histogram: Vec<OpcodeCount>,
}

impl ProfileReport {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} samples ({} in VM, {} in compiled code) over {:.1} ms",
            self.total_samples,
            self.vm_samples,
            self.native_samples,
            self.duration_us as f64 / 1000.0
        );
        if !self.opcodes.is_empty() {
            let _ = writeln!(
                out,
                "\n{:<28} {:>8} {:>7} {:>7} {:>9} {:>7}",
                "opcode", "samples", "% VM", "% total", "in helper", "% self"
            );
            for op in &self.opcodes {
                let _ = writeln!(
                    out,
                    "{:<28} {:>8} {:>6.1}% {:>6.1}% {:>9} {:>6.1}%",
                    op.name, op.samples, op.percent_vm, op.percent_total, op.in_helper, op.percent_self
                );
            }
        }
        if !self.lines.is_empty() {
            let _ = writeln!(out, "\n{:<28} {:>6} {:>8}", "code block", "line", "samples");
            for line in &self.lines {
                let number = line.line.map(|l| l.to_string()).unwrap_or_else(|| "?".into());
                let _ = writeln!(out, "{:<28} {:>6} {:>8}", line.code_block, number, line.samples);
            }
        }
        if !self.histogram.is_empty() {
            let _ = writeln!(out, "\n{:<28} {:>12}", "opcode", "executed");
            for entry in &self.histogram {
                let _ = writeln!(out, "{:<28} {:>12}", entry.name, entry.count);
            }
        }
        out
    }
}

impl std::fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> ProfileReport {
        ProfileReport {
            duration_us: 2_000,
            total_samples: 10,
            vm_samples: 8,
            native_samples: 2,
            opcodes: vec![OpcodeReport {
                name: "add".into(),
                samples: 6,
                percent_vm: 75.0,
                percent_total: 60.0,
                in_helper: 3,
                percent_self: 50.0,
            }],
            lines: vec![LineReport {
                code_block: "fib".into(),
                line: Some(4),
                samples: 6,
            }],
            histogram: vec![OpcodeCount {
                name: "add".into(),
                count: 1_000,
            }],
        }
    }

    #[test]
    fn text_lists_every_column() {
        let text = report().to_text();
        assert!(text.contains("% VM"));
        assert!(text.contains("in helper"));
        assert!(text.contains("75.0%"));
        assert!(text.contains("fib"));
        assert!(text.contains("1000"));
    }

    #[test]
    fn json_export() {
        let json = report().to_json();
        assert_eq!(json["opcodes"][0]["name"], "add");
        assert_eq!(json["lines"][0]["line"], 4);
        assert_eq!(json["total_samples"], 10);
    }
}
