//! Engine configuration

use heron_vm_value::Encoding;
use serde::{Deserialize, Serialize};

/// Engine limits and tiering knobs. Every field has a default, so a JSON
/// document only needs the fields it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub encoding: Encoding,
    pub jit_enabled: bool,
    /// Entry plus back-edge count after which a CodeBlock is compiled
    pub jit_threshold: u32,
    pub max_call_depth: u32,
    /// Register file capacity in words
    pub register_file_words: usize,
    /// Cell table capacity
    pub heap_capacity: usize,
    /// Entries a property site holds before going generic
    pub polymorphic_limit: usize,
    /// Callees a call site holds before going generic
    pub call_polymorphic_limit: usize,
    /// Prototypes a cached chain load may walk through
    pub prototype_chain_limit: usize,
    /// Count every interpreted opcode into the profiler histogram
    pub opcode_histogram: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::NanBox,
            jit_enabled: true,
            jit_threshold: 100,
            max_call_depth: 1_000,
            register_file_words: 1 << 16,
            heap_capacity: 1 << 20,
            polymorphic_limit: 4,
            call_polymorphic_limit: 4,
            prototype_chain_limit: 8,
            opcode_histogram: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_jit(mut self, enabled: bool) -> Self {
        self.jit_enabled = enabled;
        self
    }

    pub fn with_jit_threshold(mut self, threshold: u32) -> Self {
        self.jit_threshold = threshold;
        self
    }

    pub fn with_max_call_depth(mut self, depth: u32) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_register_file_words(mut self, words: usize) -> Self {
        self.register_file_words = words;
        self
    }

    pub fn with_heap_capacity(mut self, cells: usize) -> Self {
        self.heap_capacity = cells;
        self
    }

    pub fn with_polymorphic_limit(mut self, limit: usize) -> Self {
        self.polymorphic_limit = limit.max(2);
        self
    }

    pub fn with_call_polymorphic_limit(mut self, limit: usize) -> Self {
        self.call_polymorphic_limit = limit.max(2);
        self
    }

    pub fn with_prototype_chain_limit(mut self, limit: usize) -> Self {
        self.prototype_chain_limit = limit;
        self
    }

    pub fn with_opcode_histogram(mut self, enabled: bool) -> Self {
        self.opcode_histogram = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.encoding, Encoding::NanBox);
        assert!(config.jit_enabled);
        assert_eq!(config.jit_threshold, 100);
        assert_eq!(config.max_call_depth, 1_000);
        assert_eq!(config.polymorphic_limit, 4);
        assert_eq!(config.prototype_chain_limit, 8);
    }

    #[test]
    fn json_overrides_only_named_fields() {
        let config =
            EngineConfig::from_json(r#"{"encoding": "tag-payload", "jit_threshold": 5}"#).unwrap();
        assert_eq!(config.encoding, Encoding::TagPayload);
        assert_eq!(config.jit_threshold, 5);
        assert_eq!(config.max_call_depth, 1_000);
    }
}
