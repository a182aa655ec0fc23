//! String extraction across every function of a recovered CFG.

use crate::services::analysis::{AnalysisError, LoadedBinary, StringReference};

/// Collect string references from every function, in CFG order.
///
/// Workaround: a function failing with the degenerate-function defect class
/// contributes nothing and the walk continues. This mirrors an upstream
/// engine bug (arithmetic faults on empty function bodies), not a general
/// tolerance policy; every other error aborts the walk.
pub fn collect_string_references(
    program: &dyn LoadedBinary,
) -> Result<Vec<StringReference>, AnalysisError> {
    let mut references = Vec::new();
    for function in &program.cfg().functions {
        match program.string_references(function) {
            Ok(found) => {
                log::debug!(
                    "{}: {} string reference(s)",
                    function.display_name(),
                    found.len()
                );
                references.extend(found);
            }
            Err(err) if err.is_function_defect() => {
                log::warn!("skipping {}: {err}", function.display_name());
            }
            Err(err) => return Err(err),
        }
    }
    Ok(references)
}

/// Flatten references to their byte strings, keeping order.
pub fn referenced_strings(references: Vec<StringReference>) -> Vec<Vec<u8>> {
    references.into_iter().map(|r| r.bytes).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::services::analysis::{ControlFlowGraph, FunctionRecord};

    enum Outcome {
        Strings(Vec<&'static str>),
        Defect,
        Fatal,
    }

    struct Scripted {
        cfg: ControlFlowGraph,
        outcomes: HashMap<u64, Outcome>,
    }

    impl Scripted {
        fn new(outcomes: Vec<(u64, Outcome)>) -> Self {
            let functions = outcomes
                .iter()
                .map(|(address, _)| FunctionRecord { address: *address, name: None, size: None })
                .collect();
            Self {
                cfg: ControlFlowGraph { functions, ..Default::default() },
                outcomes: outcomes.into_iter().collect(),
            }
        }
    }

    impl LoadedBinary for Scripted {
        fn cfg(&self) -> &ControlFlowGraph {
            &self.cfg
        }

        fn string_references(
            &self,
            function: &FunctionRecord,
        ) -> Result<Vec<StringReference>, AnalysisError> {
            match &self.outcomes[&function.address] {
                Outcome::Strings(list) => Ok(list
                    .iter()
                    .enumerate()
                    .map(|(i, s)| StringReference {
                        address: function.address + i as u64,
                        bytes: s.as_bytes().to_vec(),
                    })
                    .collect()),
                Outcome::Defect => Err(AnalysisError::DegenerateFunction {
                    address: function.address,
                    reason: "scripted".into(),
                }),
                Outcome::Fatal => Err(AnalysisError::Backend("scripted failure".into())),
            }
        }
    }

    #[test]
    fn flattens_references_in_function_order() {
        let program = Scripted::new(vec![
            (0x10, Outcome::Strings(vec!["GET", "POST"])),
            (0x20, Outcome::Strings(vec![])),
            (0x30, Outcome::Strings(vec!["HEAD"])),
        ]);
        let refs = collect_string_references(&program).expect("collect");
        let strings = referenced_strings(refs);
        assert_eq!(strings, vec![b"GET".to_vec(), b"POST".to_vec(), b"HEAD".to_vec()]);
    }

    #[test]
    fn defective_function_contributes_nothing() {
        let program = Scripted::new(vec![
            (0x10, Outcome::Strings(vec!["before"])),
            (0x20, Outcome::Defect),
            (0x30, Outcome::Strings(vec!["after"])),
        ]);
        let strings = referenced_strings(collect_string_references(&program).expect("collect"));
        assert_eq!(strings, vec![b"before".to_vec(), b"after".to_vec()]);
    }

    #[test]
    fn other_failures_abort_the_walk() {
        let program = Scripted::new(vec![
            (0x10, Outcome::Strings(vec!["before"])),
            (0x20, Outcome::Fatal),
            (0x30, Outcome::Strings(vec!["after"])),
        ]);
        let err = collect_string_references(&program).unwrap_err();
        assert!(matches!(err, AnalysisError::Backend(_)));
    }
}
