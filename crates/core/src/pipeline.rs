//! Load → extract → filter/encode → write.

use std::path::Path;

use thiserror::Error;

use crate::dictionary::{Dictionary, DictionaryError};
use crate::services::analysis::{AnalysisBackend, AnalysisError, AnalysisRequest};
use crate::services::extraction::{collect_string_references, referenced_strings};

#[derive(Debug, Error)]
pub enum CreateError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Dictionary(#[from] DictionaryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictionaryOutcome {
    /// The file was written with this many entries.
    Written { entries: usize },
    /// No usable strings; the output path was not touched.
    Empty,
}

impl DictionaryOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, DictionaryOutcome::Written { .. })
    }
}

/// Build the dictionary for `request.binary_path` and write it to `outfile`.
pub fn create_dictionary(
    backend: &dyn AnalysisBackend,
    request: &AnalysisRequest,
    outfile: &Path,
) -> Result<DictionaryOutcome, CreateError> {
    let program = backend.load(request)?;
    let cfg = program.cfg();
    log::info!(
        "{}: recovered {} function(s), {} block(s)",
        backend.name(),
        cfg.functions.len(),
        cfg.basic_blocks.len()
    );

    let strings = referenced_strings(collect_string_references(&*program)?);
    let total = strings.len();
    let dictionary = Dictionary::from_strings(strings);
    log::info!("{} of {total} referenced string(s) usable", dictionary.len());

    if dictionary.is_empty() {
        return Ok(DictionaryOutcome::Empty);
    }
    dictionary.write_to(outfile)?;
    log::info!("wrote {} entries to {}", dictionary.len(), outfile.display());
    Ok(DictionaryOutcome::Written { entries: dictionary.len() })
}
