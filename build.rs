//! Generates the `ErrorKind` enum from the crate's module tree.
//!
//! Every directory under `src/cluster/` containing a `mod.rs` maps to one
//! CamelCase variant, e.g. `src/cluster/communication/message` becomes
//! `ErrorKind::CommunicationMessage`. The crate root maps to `ErrorKind::Error`.

use std::env;
use std::fs;
use std::path::Path;

use itertools::Itertools;

const MODULE_ROOT: &str = "src/cluster";

fn main() {
    println!("cargo:rerun-if-changed={}", MODULE_ROOT);

    let mut kinds = vec![String::from("Error")];
    let mut trail = Vec::new();
    collect_kinds(Path::new(MODULE_ROOT), &mut trail, &mut kinds);

    let variants = kinds
        .iter()
        .sorted()
        .dedup()
        .map(|kind| format!("    {},", kind))
        .join("\n");

    let code = format!(
        "\
/// Kinds of errors, one per module of this crate.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = \"serialize_serde\", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {{
{}
}}
",
        variants,
    );

    let out_dir = env::var("OUT_DIR").unwrap();
    let dest = Path::new(&out_dir).join("error_kind.rs");
    fs::write(dest, code).unwrap();
}

fn collect_kinds(dir: &Path, trail: &mut Vec<String>, kinds: &mut Vec<String>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_owned(),
            None => continue,
        };
        // the error module itself names the root kind
        if trail.is_empty() && name == "error" {
            continue;
        }
        trail.push(name);
        if path.join("mod.rs").is_file() {
            kinds.push(trail.iter().map(|seg| camel(seg)).join(""));
        }
        collect_kinds(&path, trail, kinds);
        trail.pop();
    }
}

fn camel(segment: &str) -> String {
    segment
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}
