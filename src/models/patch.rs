use serde::{Deserialize, Serialize};

pub const OP_REPLACE: &str = "replace";
pub const PATH_STATUS: &str = "status";

/// One element of a PATCH request body, e.g.
/// `{"op": "replace", "path": "status", "value": "finished"}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatchOperation {
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl PatchOperation {
    pub fn replace_status(value: impl Into<String>) -> Self {
        Self {
            op: OP_REPLACE.to_string(),
            path: PATH_STATUS.to_string(),
            value: Some(value.into()),
        }
    }
}
