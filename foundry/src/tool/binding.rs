//! Tool bindings: the manifest-declared descriptor per tool, resolved once at
//! boot. Unknown names fail fast at invocation.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON type tag for one declared argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl ArgKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ArgKind::String => value.is_string(),
            ArgKind::Number => value.is_number(),
            ArgKind::Integer => value.is_i64() || value.is_u64(),
            ArgKind::Boolean => value.is_boolean(),
            ArgKind::Object => value.is_object(),
            ArgKind::Array => value.is_array(),
            ArgKind::Any => true,
        }
    }
}

/// One declared argument of a tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArgField {
    pub name: String,
    pub kind: ArgKind,
    #[serde(default)]
    pub required: bool,
}

impl ArgField {
    pub fn required(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Manifest-declared descriptor of one tool (or one `ns` server).
#[derive(Clone, Debug)]
pub struct ToolBinding {
    pub name: String,
    /// Logical service name (resolved through the registry) or a literal URL.
    pub endpoint: String,
    pub idempotency_ttl: Duration,
    pub concurrency_cap: usize,
    pub arguments: Vec<ArgField>,
}

impl ToolBinding {
    pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
    pub const DEFAULT_CONCURRENCY_CAP: usize = 8;

    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            idempotency_ttl: Self::DEFAULT_IDEMPOTENCY_TTL,
            concurrency_cap: Self::DEFAULT_CONCURRENCY_CAP,
            arguments: Vec::new(),
        }
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    pub fn with_concurrency_cap(mut self, cap: usize) -> Self {
        self.concurrency_cap = cap.max(1);
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<ArgField>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Validates arguments against the declared schema. An empty declaration
    /// accepts anything (the server owns full validation either way).
    pub fn validate(&self, arguments: &Value) -> Result<(), String> {
        if self.arguments.is_empty() {
            return Ok(());
        }
        let Some(map) = arguments.as_object() else {
            return Err(format!("tool '{}' expects an object of arguments", self.name));
        };
        for field in &self.arguments {
            match map.get(&field.name) {
                None if field.required => {
                    return Err(format!(
                        "tool '{}' missing required argument '{}'",
                        self.name, field.name
                    ));
                }
                None => {}
                Some(value) if !field.kind.accepts(value) => {
                    return Err(format!(
                        "tool '{}' argument '{}' has wrong type (expected {:?})",
                        self.name, field.name, field.kind
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// All tool bindings of one runtime instance.
///
/// Resolution tries the exact name first, then the `ns` prefix of `ns.op` —
/// a binding named `tasks` serves every `tasks.*` operation.
#[derive(Clone, Debug, Default)]
pub struct ToolCatalog {
    bindings: HashMap<String, ToolBinding>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, binding: ToolBinding) {
        self.bindings.insert(binding.name.clone(), binding);
    }

    pub fn with(mut self, binding: ToolBinding) -> Self {
        self.insert(binding);
        self
    }

    pub fn resolve(&self, tool_name: &str) -> Option<&ToolBinding> {
        if let Some(binding) = self.bindings.get(tool_name) {
            return Some(binding);
        }
        let (ns, _op) = tool_name.split_once('.')?;
        self.bindings.get(ns)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &ToolBinding> {
        self.bindings.values()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
