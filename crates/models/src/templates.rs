use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Template name which is owned by the system and can't be upserted by users.
pub const RESERVED_SYSTEM_DEFAULT: &str = "system-default";

pub fn is_reserved_name(name: &str) -> bool {
    name == RESERVED_SYSTEM_DEFAULT
}

/// A declared variable of a Template, with the default used when a rule
/// or render request doesn't supply it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub description: String,
}

/// Template is a reusable body with `[[ ]]` expressions and declared variables.
/// `body` holds text, and is opaque until rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub id: u64,
    pub name: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A notification message body for one receiver type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub receiver_type: String,
    pub content: String,
}
