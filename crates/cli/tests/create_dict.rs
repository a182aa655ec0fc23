#![cfg(feature = "capstone-backend")]

use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use object::write::{Object, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};
use dictgen_core::services::image::RELOCATABLE_BASE;
use predicates::prelude::*;
use tempfile::tempdir;

/// x86_64 object whose single function loads each string with `mov edi, imm32`.
fn elf_referencing(dir: &Path, strings: &[&[u8]]) -> PathBuf {
    let text_len = strings.len() * 5 + 1;
    let base = RELOCATABLE_BASE + text_len as u64;
    let mut text = Vec::new();
    let mut rodata = Vec::new();
    for s in strings {
        text.push(0xbf);
        text.extend_from_slice(&((base + rodata.len() as u64) as u32).to_le_bytes());
        rodata.extend_from_slice(s);
        rodata.push(0);
    }
    text.push(0xc3);

    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text_id = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.section_mut(text_id).set_data(text, 1);
    let ro_id = obj.add_section(Vec::new(), b".rodata".to_vec(), SectionKind::ReadOnlyData);
    obj.section_mut(ro_id).set_data(rodata, 1);
    obj.add_symbol(Symbol {
        name: b"handler".to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text_id),
        flags: SymbolFlags::Elf { st_info: 0x12, st_other: 0 },
    });

    let path = dir.join("target.o");
    std::fs::write(&path, obj.write().unwrap()).unwrap();
    path
}

#[test]
fn no_arguments_fails_without_writing() {
    let temp = tempdir().unwrap();
    cargo_bin_cmd!("create_dict")
        .current_dir(temp.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("incorrect number of arguments"));
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[test]
fn single_argument_fails_without_writing() {
    let temp = tempdir().unwrap();
    let bin = elf_referencing(temp.path(), &[&b"GET"[..]]);
    cargo_bin_cmd!("create_dict")
        .current_dir(temp.path())
        .arg(&bin)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("incorrect number of arguments"));
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
}

#[test]
fn help_and_version_exit_zero() {
    cargo_bin_cmd!("create_dict")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--mem-limit"));
    cargo_bin_cmd!("create_dict")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("create_dict"));
}

#[test]
fn writes_dictionary_and_exits_zero() {
    let temp = tempdir().unwrap();
    let bin = elf_referencing(temp.path(), &[&b"hello world"[..], &b"user=%s&pass"[..]]);
    let out = temp.path().join("out.dict");

    cargo_bin_cmd!("create_dict")
        .arg(&bin)
        .arg(&out)
        .env_remove("DRILLER_MEM_LIMIT")
        .env_remove("DRILLER_DICTIONARY_TIMEOUT")
        .assert()
        .success()
        .stderr(predicate::str::contains("sha256"));

    assert_eq!(
        std::fs::read_to_string(&out).unwrap(),
        "driller_0=\"hello world\"\ndriller_1=\"user\\x3d\\x25s\\x26pass\"\n"
    );
}

#[test]
fn extra_positionals_are_ignored() {
    let temp = tempdir().unwrap();
    let bin = elf_referencing(temp.path(), &[&b"EXTRA"[..]]);
    let out = temp.path().join("out.dict");

    cargo_bin_cmd!("create_dict")
        .arg(&bin)
        .arg(&out)
        .arg("leftover")
        .assert()
        .success()
        .stderr(predicate::str::contains("ignoring 1 extra argument"));
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "driller_0=\"EXTRA\"\n");
}

#[test]
fn empty_dictionary_exits_one_and_writes_nothing() {
    let temp = tempdir().unwrap();
    let long = vec![b'Z'; 200];
    let bin = elf_referencing(temp.path(), &[long.as_slice()]);
    let out = temp.path().join("out.dict");

    cargo_bin_cmd!("create_dict").arg(&bin).arg(&out).assert().code(1);
    assert!(!out.exists());
}

#[test]
fn resource_limits_from_env_and_flags_are_accepted() {
    let temp = tempdir().unwrap();
    let bin = elf_referencing(temp.path(), &[&b"LIMITED"[..]]);
    let out = temp.path().join("out.dict");

    cargo_bin_cmd!("create_dict")
        .arg(&bin)
        .arg(&out)
        .arg("--timeout")
        .arg("600")
        .env("DRILLER_MEM_LIMIT", (16u64 << 30).to_string())
        .assert()
        .success()
        .stderr(predicate::str::contains("address space limited"));
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "driller_0=\"LIMITED\"\n");
}

#[test]
fn invalid_env_limit_is_an_error() {
    let temp = tempdir().unwrap();
    let bin = elf_referencing(temp.path(), &[&b"GET"[..]]);
    let out = temp.path().join("out.dict");

    cargo_bin_cmd!("create_dict")
        .arg(&bin)
        .arg(&out)
        .env("DRILLER_DICTIONARY_TIMEOUT", "soon")
        .assert()
        .failure()
        .stderr(predicate::str::contains("DRILLER_DICTIONARY_TIMEOUT"));
    assert!(!out.exists());
}

#[test]
fn config_file_selects_backend() {
    let temp = tempdir().unwrap();
    let bin = elf_referencing(temp.path(), &[&b"GET"[..]]);
    let out = temp.path().join("out.dict");
    let cfg = temp.path().join("dict.json");
    std::fs::write(&cfg, r#"{"backend": "no-such-backend"}"#).unwrap();

    cargo_bin_cmd!("create_dict")
        .arg(&bin)
        .arg(&out)
        .arg("--config")
        .arg(&cfg)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no-such-backend"));

    cargo_bin_cmd!("create_dict")
        .arg(&bin)
        .arg(&out)
        .arg("--config")
        .arg(&cfg)
        .arg("--backend")
        .arg("capstone")
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "driller_0=\"GET\"\n");
}

#[test]
fn missing_binary_is_a_failure() {
    let temp = tempdir().unwrap();
    let out = temp.path().join("out.dict");
    cargo_bin_cmd!("create_dict")
        .arg(temp.path().join("absent"))
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Binary not found"));
    assert!(!out.exists());
}
