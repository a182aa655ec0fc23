use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimal IR for functions recovered from a binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub address: u64,
    pub name: Option<String>,
    pub size: Option<u64>,
}

impl FunctionRecord {
    /// Name for log lines: the symbol when known, `sub_<hex>` otherwise.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("sub_{:x}", self.address))
    }
}

/// A byte string a function's code loads or compares against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringReference {
    /// Address of the referenced string.
    pub address: u64,
    pub bytes: Vec<u8>,
}

/// Kind of control-flow edge for a basic block successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockEdgeKind {
    Fallthrough,
    Jump,
    ConditionalJump,
    IndirectJump,
    Call,
    IndirectCall,
}

/// Basic block representation; `len` counts instructions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub start: u64,
    pub len: u32,
    pub successors: Vec<BlockEdge>,
}

/// Successor edge with target and edge classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEdge {
    pub target: u64,
    pub kind: BlockEdgeKind,
}

/// Whole-binary control-flow graph as recovered by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlowGraph {
    pub functions: Vec<FunctionRecord>,
    pub basic_blocks: Vec<BasicBlock>,
    pub backend_version: Option<String>,
    pub backend_path: Option<String>,
}

/// Analysis depth knobs for CFG recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfgOptions {
    /// Carry tracked register state from a block into its successors instead
    /// of starting every block from an empty state.
    pub keep_input_state: bool,
    /// Track register constants through moves, address arithmetic and
    /// PC-relative loads so indirectly built pointers are recovered.
    pub advanced_backward_slicing: bool,
    /// Per-function instruction budget for backends that disassemble.
    pub max_instructions: Option<usize>,
}

impl Default for CfgOptions {
    fn default() -> Self {
        Self { keep_input_state: true, advanced_backward_slicing: true, max_instructions: None }
    }
}

/// Request to load a binary and recover its CFG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub binary_path: PathBuf,
    /// Optional architecture hint (e.g., x86_64, arm64, armv7).
    pub arch: Option<String>,
    pub options: CfgOptions,
    /// Optional explicit backend tool path (e.g., a rizin executable).
    pub backend_path: Option<PathBuf>,
}

impl AnalysisRequest {
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            arch: None,
            options: CfgOptions::default(),
            backend_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Binary not found at {0}")]
    MissingBinary(PathBuf),
    #[error("Backend not found: {0}")]
    MissingBackend(String),
    #[error("Failed to load {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("Analysis backend error: {0}")]
    Backend(String),
    /// Degenerate function body (no decodable code, zero-sized range).
    ///
    /// Upstream engines hit arithmetic faults on these; callers that walk
    /// every function treat it as "no strings here" rather than fatal.
    #[error("Degenerate function at 0x{address:x}: {reason}")]
    DegenerateFunction { address: u64, reason: String },
}

impl AnalysisError {
    /// True for the per-function defect class that string extraction skips.
    pub fn is_function_defect(&self) -> bool {
        matches!(self, AnalysisError::DegenerateFunction { .. })
    }
}

/// A binary after CFG recovery, able to answer per-function queries.
pub trait LoadedBinary {
    fn cfg(&self) -> &ControlFlowGraph;

    /// Strings referenced by `function`, in first-reference order.
    fn string_references(
        &self,
        function: &FunctionRecord,
    ) -> Result<Vec<StringReference>, AnalysisError>;
}

/// Trait implemented by analysis backends (e.g., Capstone, rizin).
pub trait AnalysisBackend: Send + Sync {
    fn load(&self, request: &AnalysisRequest) -> Result<Box<dyn LoadedBinary>, AnalysisError>;
    fn name(&self) -> &'static str;
}

/// Registry for analysis backends; callers select by name.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Box<dyn AnalysisBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self { backends: HashMap::new() }
    }

    pub fn register<B: AnalysisBackend + 'static>(&mut self, backend: B) -> &mut Self {
        self.backends.insert(backend.name().to_string(), Box::new(backend));
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn AnalysisBackend> {
        self.backends.get(name).map(|b| &**b)
    }

    /// Like `get`, but reports the registered names when `name` is unknown.
    pub fn resolve(&self, name: &str) -> Result<&dyn AnalysisBackend, AnalysisError> {
        self.get(name).ok_or_else(|| {
            AnalysisError::MissingBackend(format!(
                "{name} (available: {})",
                self.names().join(", ")
            ))
        })
    }

    /// Return a sorted list of registered backend names for error messages/help.
    pub fn names(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.backends.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Default backend name when neither CLI nor config picks one.
pub const DEFAULT_BACKEND: &str = "capstone";

/// Registry populated with every backend compiled into this build.
pub fn default_backend_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    #[cfg(feature = "capstone-backend")]
    {
        registry.register(crate::services::backends::CapstoneBackend);
    }
    #[cfg(feature = "rizin-backend")]
    {
        registry.register(crate::services::backends::RizinBackend);
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl AnalysisBackend for Named {
        fn load(&self, request: &AnalysisRequest) -> Result<Box<dyn LoadedBinary>, AnalysisError> {
            Err(AnalysisError::MissingBinary(request.binary_path.clone()))
        }

        fn name(&self) -> &'static str {
            self.0
        }
    }

    #[test]
    fn registry_lists_names_sorted_and_reports_unknown() {
        let mut registry = BackendRegistry::new();
        registry.register(Named("zeta")).register(Named("alpha"));
        assert_eq!(registry.names(), vec!["alpha".to_string(), "zeta".to_string()]);

        let err = registry.resolve("nope").err().expect("unknown backend");
        let msg = err.to_string();
        assert!(msg.contains("nope") && msg.contains("alpha, zeta"), "unexpected: {msg}");
    }

    #[test]
    fn only_degenerate_functions_are_function_defects() {
        let defect = AnalysisError::DegenerateFunction { address: 0x10, reason: "empty".into() };
        assert!(defect.is_function_defect());
        assert!(!AnalysisError::Backend("boom".into()).is_function_defect());
        assert!(!AnalysisError::MissingBinary("x".into()).is_function_defect());
    }

    #[test]
    fn display_name_falls_back_to_address() {
        let anon = FunctionRecord { address: 0x4010, name: None, size: None };
        assert_eq!(anon.display_name(), "sub_4010");
        let named = FunctionRecord { address: 0, name: Some("main".into()), size: Some(4) };
        assert_eq!(named.display_name(), "main");
    }

    #[test]
    fn default_options_request_full_depth() {
        let req = AnalysisRequest::new("/bin/true");
        assert!(req.options.keep_input_state);
        assert!(req.options.advanced_backward_slicing);
        assert_eq!(req.options.max_instructions, None);
    }
}
