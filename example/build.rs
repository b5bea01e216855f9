use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use scrivener_compiler::error::CompileError;
use scrivener_compiler::{compile_files, CompileOptions, GenOptions};

/// Generated module and the protocol files it is built from.
const MODULES: &[(&str, &[&str])] = &[
    ("purchase", &["buyer.scr", "seller.scr", "shipper.scr"]),
    ("negotiate", &["negotiate.scr"]),
    ("rounds", &["rounds.scr"]),
];

fn main() -> Result<(), CompileError> {
    let protocols = Path::new(env!("CARGO_MANIFEST_DIR")).join("../protocols");
    let out_dir = env::var("OUT_DIR").map_err(|err| CompileError::CodegenError(err.to_string()))?;
    println!("cargo:rerun-if-changed={}", protocols.display());

    for (module, files) in MODULES {
        let paths: Vec<PathBuf> = files.iter().map(|file| protocols.join(file)).collect();
        let options = CompileOptions {
            gen: GenOptions { module_name: module.to_string(), inline: true },
            ..CompileOptions::default()
        };
        let code = compile_files(&paths, &options)?;
        fs::write(Path::new(&out_dir).join(format!("{}.rs", module)), code)?;
    }
    Ok(())
}
