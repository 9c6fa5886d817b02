use std::fs;
use std::path::{Component, Path, PathBuf};

use hook_plugin::message::HookStage;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Runtime kinds a bundle can target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display,
    EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DriverKind {
    /// Embedded Rhai scripts.
    Rhai,
    /// A child process speaking JSON-RPC over stdio.
    Process,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest is not valid JSON: {0}")]
    Malformed(String),
    #[error("manifest does not match its schema: {}", .0.join("; "))]
    Schema(Vec<String>),
    #[error("file_list is empty")]
    EmptyFileList,
    #[error("file '{0}' listed in the manifest does not exist")]
    MissingFile(String),
    #[error("file '{0}' is outside the bundle directory")]
    FileOutsideBundle(String),
    #[error("unknown driver '{0}'")]
    UnknownDriver(String),
    #[error("a bundle may declare at most one auth_check")]
    DuplicateAuthCheck,
    #[error("empty hook name in stage '{0}'")]
    EmptyHookName(HookStage),
    #[error("checksum mismatch: manifest says {expected}, files hash to {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("no driver registered for '{0}'")]
    DriverUnavailable(DriverKind),
    #[error("hook '{name}' bound to '{stage}' is not defined by the bundle")]
    UnresolvedHook { stage: HookStage, name: String },
    #[error("driver refused the bundle: {0}")]
    Driver(String),
}

// -----------------------------------------------------------------------------
// On-disk format
// -----------------------------------------------------------------------------

/// `manifest.json` as written by bundle authors.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BundleManifest {
    /// Files making up the bundle, relative to the bundle directory.
    #[schemars(length(min = 1))]
    pub file_list: Vec<String>,
    pub custom_middleware: MiddlewareSection,
    /// Optional hex SHA-256 over the listed files, in declared order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MiddlewareSection {
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_check: Option<AuthCheck>,
    #[serde(default)]
    pub pre: Vec<HookDefinition>,
    #[serde(default)]
    pub post_key_auth: Vec<HookDefinition>,
    #[serde(default)]
    pub post: Vec<HookDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HookDefinition {
    pub name: String,
}

/// `auth_check` is a single object; a list is accepted only to report
/// duplicates precisely.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum AuthCheck {
    One(HookDefinition),
    Many(Vec<HookDefinition>),
}

/// JSON schema generated from [`BundleManifest`].
pub fn manifest_schema() -> Value {
    serde_json::to_value(schema_for!(BundleManifest)).unwrap_or(Value::Null)
}

// -----------------------------------------------------------------------------
// Loaded bundle
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookBinding {
    pub stage: HookStage,
    pub name: String,
    /// Position within its stage, as declared.
    pub order: usize,
}

/// A validated bundle. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub id: String,
    pub base_dir: PathBuf,
    pub file_list: Vec<String>,
    pub driver: DriverKind,
    pub hooks: Vec<HookBinding>,
}

impl Bundle {
    /// Read and validate `<dir>/manifest.json`. Nothing is executed.
    pub fn load(dir: impl AsRef<Path>) -> Result<Bundle, ManifestError> {
        let dir = dir.as_ref();
        let base_dir = dir.canonicalize().map_err(|source| ManifestError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let manifest_path = base_dir.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&manifest_path).map_err(|source| ManifestError::Io {
            path: manifest_path.clone(),
            source,
        })?;

        let manifest = parse_manifest(&raw)?;
        let id = base_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("bundle")
            .to_string();
        Bundle::from_manifest(id, base_dir, manifest)
    }

    /// Validate an already-parsed manifest against `base_dir`.
    pub fn from_manifest(
        id: String,
        base_dir: PathBuf,
        manifest: BundleManifest,
    ) -> Result<Bundle, ManifestError> {
        if manifest.file_list.is_empty() {
            return Err(ManifestError::EmptyFileList);
        }
        for file in &manifest.file_list {
            resolve_file(&base_dir, file)?;
        }

        let middleware = manifest.custom_middleware;
        let driver = middleware
            .driver
            .trim()
            .parse::<DriverKind>()
            .map_err(|_| ManifestError::UnknownDriver(middleware.driver.clone()))?;

        let mut hooks = Vec::new();
        match middleware.auth_check {
            None => {}
            Some(AuthCheck::One(h)) => hooks.push(binding(HookStage::Auth, h, 0)?),
            Some(AuthCheck::Many(list)) => match list.len() {
                0 => {}
                1 => {
                    let h = list.into_iter().next().ok_or(ManifestError::DuplicateAuthCheck)?;
                    hooks.push(binding(HookStage::Auth, h, 0)?)
                }
                _ => return Err(ManifestError::DuplicateAuthCheck),
            },
        }
        for (stage, list) in [
            (HookStage::Pre, middleware.pre),
            (HookStage::PostKeyAuth, middleware.post_key_auth),
            (HookStage::Post, middleware.post),
        ] {
            for (order, h) in list.into_iter().enumerate() {
                hooks.push(binding(stage, h, order)?);
            }
        }

        if let Some(expected) = manifest.checksum {
            let actual = checksum(&base_dir, &manifest.file_list)?;
            if !expected.trim().eq_ignore_ascii_case(&actual) {
                return Err(ManifestError::ChecksumMismatch { expected, actual });
            }
        }

        Ok(Bundle { id, base_dir, file_list: manifest.file_list, driver, hooks })
    }

    /// Bindings for `stage`, in declared order.
    pub fn hooks_for(&self, stage: HookStage) -> impl Iterator<Item = &HookBinding> {
        self.hooks.iter().filter(move |h| h.stage == stage)
    }

    pub fn auth_hook(&self) -> Option<&HookBinding> {
        self.hooks_for(HookStage::Auth).next()
    }

    /// Absolute paths of the listed files, in declared order.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.file_list.iter().map(|f| self.base_dir.join(f)).collect()
    }
}

fn parse_manifest(raw: &str) -> Result<BundleManifest, ManifestError> {
    let instance: Value =
        serde_json::from_str(raw).map_err(|e| ManifestError::Malformed(e.to_string()))?;

    let schema = manifest_schema();
    let validator = jsonschema::validator_for(&schema)
        .map_err(|e| ManifestError::Malformed(format!("manifest schema: {e}")))?;
    let problems: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| format!("{}: {e}", e.instance_path))
        .collect();
    if !problems.is_empty() {
        return Err(ManifestError::Schema(problems));
    }

    // typed parse from the raw text so repeated keys are caught
    serde_json::from_str::<BundleManifest>(raw).map_err(|e| {
        let msg = e.to_string();
        if msg.contains("duplicate field `auth_check`") {
            ManifestError::DuplicateAuthCheck
        } else {
            ManifestError::Malformed(msg)
        }
    })
}

fn binding(stage: HookStage, def: HookDefinition, order: usize) -> Result<HookBinding, ManifestError> {
    let name = def.name.trim().to_string();
    if name.is_empty() {
        return Err(ManifestError::EmptyHookName(stage));
    }
    Ok(HookBinding { stage, name, order })
}

fn resolve_file(base_dir: &Path, file: &str) -> Result<PathBuf, ManifestError> {
    let rel = Path::new(file);
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir))
    {
        return Err(ManifestError::FileOutsideBundle(file.to_string()));
    }
    let full = base_dir.join(rel);
    let canonical = full
        .canonicalize()
        .map_err(|_| ManifestError::MissingFile(file.to_string()))?;
    if !canonical.starts_with(base_dir) {
        return Err(ManifestError::FileOutsideBundle(file.to_string()));
    }
    if !canonical.is_file() {
        return Err(ManifestError::MissingFile(file.to_string()));
    }
    Ok(canonical)
}

/// Lower-case hex SHA-256 over the files' bytes in declared order.
pub fn checksum(base_dir: &Path, files: &[String]) -> Result<String, ManifestError> {
    let mut hasher = Sha256::new();
    for file in files {
        let path = base_dir.join(file);
        let bytes = fs::read(&path).map_err(|source| ManifestError::Io { path, source })?;
        hasher.update(&bytes);
    }
    Ok(hasher.finalize().iter().map(|b| format!("{b:02x}")).collect())
}
