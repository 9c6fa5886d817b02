use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};

/// Point in request processing where a hook runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HookStage {
    Pre,
    Auth,
    PostKeyAuth,
    Post,
}

/// Synthetic response requested by a hook.
///
/// Every field is optional so that "unset" stays distinguishable from an
/// empty string or a zero status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReturnOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, String>>,
}

impl ReturnOverride {
    pub fn is_empty(&self) -> bool {
        self.response_code.is_none()
            && self.response_error.is_none()
            && self.response_body.is_none()
            && self.response_headers.is_none()
    }
}

/// Transferable snapshot of an HTTP request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RequestObject {
    pub method: String,
    pub url: String,
    /// The request line as it first reached the gateway.
    #[serde(default)]
    pub raw_url: String,
    #[serde(default)]
    pub scheme: String,
    /// Lower-cased header names; repeated headers are joined with `, `.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub set_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub delete_headers: Vec<String>,
    /// Decoded query string, read-only.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub add_params: BTreeMap<String, String>,
    #[serde(default)]
    pub delete_params: Vec<String>,
    /// UTF-8 view of the body; empty when the payload is not valid text.
    #[serde(default)]
    pub body: String,
    #[serde(default, with = "base64_bytes")]
    #[schemars(with = "String")]
    pub raw_body: Vec<u8>,
    #[serde(default)]
    pub return_overrides: ReturnOverride,
}

impl RequestObject {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Transferable authentication / quota / metadata state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SessionObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_max: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_remaining: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_renewal_rate: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_renews: Option<i64>,
    #[serde(default)]
    pub apply_policy_id: String,
    #[serde(default)]
    pub apply_policies: Vec<String>,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub expires: i64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Set by the gateway once a session has been authorised. Informational only.
    #[serde(default)]
    pub is_authorized: bool,
}

// -----------------------------------------------------------------------------
// JSON-RPC params / results
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InitParams {
    pub version: String,
    pub bundle_id: String,
    pub base_dir: String,
    pub files: Vec<String>,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InitResult {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct HooksResult {
    pub hooks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HealthResult {
    pub healthy: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LogParams {
    pub level: LogLevel,
    pub message: String,
}

/// Everything a hook receives.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DispatchParams {
    pub stage: HookStage,
    pub hook: String,
    pub request: RequestObject,
    pub session: SessionObject,
    /// Side-map threaded through `pre` and `auth` hooks.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Read-only API context (`APIID`, `OrgID`, `config_data`).
    #[serde(default)]
    pub spec: BTreeMap<String, String>,
}

/// Everything a hook hands back.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DispatchResult {
    pub request: RequestObject,
    pub session: SessionObject,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DispatchResult {
    /// Echo the inputs back unchanged.
    pub fn passthrough(params: DispatchParams) -> Self {
        Self {
            request: params.request,
            session: params.session,
            metadata: params.metadata,
        }
    }
}

/// Base64 transport for binary payloads inside JSON.
pub mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
