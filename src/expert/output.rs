use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Expert-specific result payload. Opaque to the router.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpertOutput(Value);

impl ExpertOutput {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Serialize any expert-defined result type.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::to_value(value)?))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for ExpertOutput {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
