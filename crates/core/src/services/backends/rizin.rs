use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::services::analysis::{
    AnalysisBackend, AnalysisError, AnalysisRequest, ControlFlowGraph, FunctionRecord,
    LoadedBinary, StringReference,
};

/// Rizin-backed analyzer that shells out to rizin with `aa;aflj` and `izj`.
///
/// Function data references (`datarefs`) that land on an entry of the string
/// table are reported as that function's string references.
pub struct RizinBackend;

impl AnalysisBackend for RizinBackend {
    fn load(&self, request: &AnalysisRequest) -> Result<Box<dyn LoadedBinary>, AnalysisError> {
        if !request.binary_path.is_file() {
            return Err(AnalysisError::MissingBinary(request.binary_path.clone()));
        }

        let rizin_path = request.backend_path.clone().unwrap_or_else(resolve_rizin_path);
        let version = version_string(&rizin_path).map_err(AnalysisError::Backend)?;

        // Allow tests to feed synthetic JSON via env to avoid needing rizin installed.
        let functions_json = match std::env::var_os("DICTGEN_RIZIN_FAKE_FUNCTIONS") {
            Some(path) => fs::read_to_string(&path).map_err(|e| {
                AnalysisError::Backend(format!("failed to read DICTGEN_RIZIN_FAKE_FUNCTIONS: {e}"))
            })?,
            None => run_rizin_json(&rizin_path, &request.binary_path, "aa;aflj")?,
        };
        let strings_json = match std::env::var_os("DICTGEN_RIZIN_FAKE_STRINGS") {
            Some(path) => fs::read_to_string(&path).map_err(|e| {
                AnalysisError::Backend(format!("failed to read DICTGEN_RIZIN_FAKE_STRINGS: {e}"))
            })?,
            None => run_rizin_json(&rizin_path, &request.binary_path, "izj")?,
        };

        let (functions, datarefs) = parse_functions(&functions_json)?;
        let strings = parse_strings(&strings_json)?;
        log::debug!("rizin: {} functions, {} strings", functions.len(), strings.len());

        Ok(Box::new(RizinProgram {
            cfg: ControlFlowGraph {
                functions,
                basic_blocks: Vec::new(),
                backend_version: Some(version),
                backend_path: Some(rizin_path.display().to_string()),
            },
            datarefs,
            strings,
        }))
    }

    fn name(&self) -> &'static str {
        "rizin"
    }
}

struct RizinProgram {
    cfg: ControlFlowGraph,
    datarefs: HashMap<u64, Vec<u64>>,
    strings: HashMap<u64, Vec<u8>>,
}

impl LoadedBinary for RizinProgram {
    fn cfg(&self) -> &ControlFlowGraph {
        &self.cfg
    }

    fn string_references(
        &self,
        function: &FunctionRecord,
    ) -> Result<Vec<StringReference>, AnalysisError> {
        if function.size == Some(0) {
            return Err(AnalysisError::DegenerateFunction {
                address: function.address,
                reason: "rizin reports a zero-sized function".into(),
            });
        }
        let Some(refs) = self.datarefs.get(&function.address) else {
            return Ok(Vec::new());
        };
        Ok(refs
            .iter()
            .filter_map(|addr| {
                self.strings
                    .get(addr)
                    .map(|bytes| StringReference { address: *addr, bytes: bytes.clone() })
            })
            .collect())
    }
}

fn resolve_rizin_path() -> PathBuf {
    std::env::var_os("RIZIN_BIN").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("rizin"))
}

fn run_rizin_json(rizin_bin: &Path, binary: &Path, command: &str) -> Result<String, AnalysisError> {
    let output = Command::new(rizin_bin)
        .args(["-2", "-q0", "-c", command])
        .arg(binary)
        .output()
        .map_err(|e| AnalysisError::Backend(format!("failed to spawn rizin: {e}")))?;
    if !output.status.success() {
        return Err(AnalysisError::Backend(format!("rizin exited with {}", output.status)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn version_string(rizin_bin: &Path) -> Result<String, String> {
    if let Some(fake) = std::env::var_os("DICTGEN_RIZIN_FAKE_VERSION") {
        return Ok(fake.to_string_lossy().to_string());
    }
    let output = Command::new(rizin_bin)
        .arg("-v")
        .output()
        .map_err(|e| format!("failed to spawn rizin: {e}"))?;
    if !output.status.success() {
        return Err(format!("rizin -v exited with {}", output.status));
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        Err("rizin -v produced no output".to_string())
    } else {
        Ok(stdout)
    }
}

#[derive(Debug, Deserialize)]
struct RizinFunction {
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    datarefs: Option<Vec<u64>>,
}

#[derive(Debug, Deserialize)]
struct RizinString {
    #[serde(default)]
    vaddr: Option<u64>,
    #[serde(default)]
    string: Option<String>,
}

type FunctionTable = (Vec<FunctionRecord>, HashMap<u64, Vec<u64>>);

fn parse_functions(body: &str) -> Result<FunctionTable, AnalysisError> {
    // An unanalyzable binary makes rizin print nothing at all.
    if body.trim().is_empty() {
        return Ok((Vec::new(), HashMap::new()));
    }
    let funcs: Vec<RizinFunction> = serde_json::from_str(body)
        .map_err(|e| AnalysisError::Backend(format!("failed to parse rizin aflj JSON: {e}")))?;
    let mut functions = Vec::new();
    let mut datarefs = HashMap::new();
    for f in funcs {
        let Some(address) = f.offset else { continue };
        functions.push(FunctionRecord { address, name: f.name, size: f.size });
        datarefs.insert(address, f.datarefs.unwrap_or_default());
    }
    Ok((functions, datarefs))
}

fn parse_strings(body: &str) -> Result<HashMap<u64, Vec<u8>>, AnalysisError> {
    if body.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let strs: Vec<RizinString> = serde_json::from_str(body)
        .map_err(|e| AnalysisError::Backend(format!("failed to parse rizin izj JSON: {e}")))?;
    Ok(strs
        .into_iter()
        .filter_map(|s| Some((s.vaddr?, s.string?.into_bytes())))
        .collect())
}
