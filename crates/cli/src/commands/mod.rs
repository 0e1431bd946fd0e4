pub(crate) mod run;
pub(crate) mod validate;

use std::path::Path;

use statetree_core::{LibraryDefinition, TreeLibrary};

use crate::{fail, OutputFormat};

/// Reads, parses and compiles a library file, exiting on any error.
pub(crate) fn load_library(path: &Path, output: OutputFormat, quiet: bool) -> TreeLibrary {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => fail(
            &format!("error reading file '{}': {}", path.display(), e),
            output,
            quiet,
        ),
    };
    let defs = match LibraryDefinition::from_json_str(&text) {
        Ok(defs) => defs,
        Err(e) => fail(
            &format!("error parsing JSON in '{}': {}", path.display(), e),
            output,
            quiet,
        ),
    };
    match TreeLibrary::compile(&defs) {
        Ok(library) => library,
        Err(e) => fail(&format!("compile error: {}", e), output, quiet),
    }
}
