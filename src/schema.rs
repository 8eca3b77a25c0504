// src/schema.rs

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Error;
use schemars::schema_for;

use crate::{
    message::Message,
    persistence::{BoardSnapshot, EdgeRecord},
};

/// The entry point invoked by `main.rs` for `Commands::Schema`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    fs::create_dir_all(out_dir)?;

    let schemas = [
        ("board.schema.json", serde_json::to_string_pretty(&schema_for!(BoardSnapshot))?),
        ("link.schema.json", serde_json::to_string_pretty(&schema_for!(EdgeRecord))?),
        ("message.schema.json", serde_json::to_string_pretty(&schema_for!(Message))?),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (name, body) in schemas {
        let path = out_dir.join(name);
        fs::write(&path, body)?;
        written.push(path);
    }
    Ok(written)
}
