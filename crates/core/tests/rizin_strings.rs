#![cfg(feature = "rizin-backend")]

use dictgen_core::services::analysis::{AnalysisBackend, AnalysisError, AnalysisRequest};
use dictgen_core::services::backends::RizinBackend;
use dictgen_core::services::extraction::{collect_string_references, referenced_strings};

#[test]
fn rizin_backend_errors_for_missing_binary() {
    let err = RizinBackend
        .load(&AnalysisRequest::new("does_not_exist.bin"))
        .err()
        .expect("missing binary");
    assert!(matches!(err, AnalysisError::MissingBinary(_)));
}

#[test]
fn rizin_backend_joins_fake_json_without_rizin_installed() {
    let temp = tempfile::tempdir().unwrap();
    let bin = temp.path().join("bin");
    std::fs::write(&bin, b"bin").unwrap();

    // Canned rizin output so CI does not need rizin installed.
    let functions = temp.path().join("aflj.json");
    std::fs::write(
        &functions,
        r#"[{"offset":4096,"name":"main","size":64,"datarefs":[8192,8300]},
            {"offset":4200,"name":"stub","size":0},
            {"offset":4300,"name":"usage","size":16,"datarefs":[8208]}]"#,
    )
    .unwrap();
    let strings = temp.path().join("izj.json");
    std::fs::write(
        &strings,
        r#"[{"vaddr":8192,"string":"--verbose"},{"vaddr":8208,"string":"usage: %s"}]"#,
    )
    .unwrap();
    std::env::set_var("DICTGEN_RIZIN_FAKE_FUNCTIONS", &functions);
    std::env::set_var("DICTGEN_RIZIN_FAKE_STRINGS", &strings);
    std::env::set_var("DICTGEN_RIZIN_FAKE_VERSION", "rizin 0.7.3-fake");

    let program = RizinBackend.load(&AnalysisRequest::new(&bin)).expect("load");
    assert_eq!(program.cfg().functions.len(), 3);
    assert_eq!(program.cfg().backend_version.as_deref(), Some("rizin 0.7.3-fake"));

    // `stub` is zero-sized and skipped; 8300 is not in the string table.
    let found = referenced_strings(collect_string_references(&*program).expect("collect"));
    assert_eq!(found, vec![b"--verbose".to_vec(), b"usage: %s".to_vec()]);

    std::env::remove_var("DICTGEN_RIZIN_FAKE_FUNCTIONS");
    std::env::remove_var("DICTGEN_RIZIN_FAKE_STRINGS");
    std::env::remove_var("DICTGEN_RIZIN_FAKE_VERSION");
}
