use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use hook_plugin::message::{DispatchParams, DispatchResult, RequestObject, SessionObject};
use schemars::schema_for;
use serde_json::Value;

use crate::api::ApiDefinition;
use crate::config::CoprocessConfig;
use crate::manifest::manifest_schema;
use crate::pipeline::PipelineResult;
use crate::policy::Policy;

fn write(out_dir: &Path, name: &str, schema: &Value) -> Result<PathBuf, Error> {
    let path = out_dir.join(format!("{name}.schema.json"));
    fs::write(&path, serde_json::to_string_pretty(schema)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Write JSON schemas for the bundle manifest, the objects hooks exchange
/// and the gateway-side definitions into `out_dir`. Returns the files
/// written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    fs::create_dir_all(out_dir)?;

    let schemas = [
        ("manifest", manifest_schema()),
        ("request", serde_json::to_value(schema_for!(RequestObject))?),
        ("session", serde_json::to_value(schema_for!(SessionObject))?),
        ("dispatch-params", serde_json::to_value(schema_for!(DispatchParams))?),
        ("dispatch-result", serde_json::to_value(schema_for!(DispatchResult))?),
        ("api", serde_json::to_value(schema_for!(ApiDefinition))?),
        ("policy", serde_json::to_value(schema_for!(Policy))?),
        ("pipeline-result", serde_json::to_value(schema_for!(PipelineResult))?),
        ("coprocess-config", serde_json::to_value(schema_for!(CoprocessConfig))?),
    ];

    schemas
        .iter()
        .map(|(name, schema)| write(out_dir, name, schema))
        .collect()
}
