use std::collections::HashMap;
use std::sync::Arc;

use dominds_core::tools::ToolDefinition;

use crate::tools::Tool;

/// Where a registered tool came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolSource {
    BuiltIn,
    Custom(String),
}

struct ToolEntry {
    tool: Arc<dyn Tool>,
    source: ToolSource,
}

/// Ordinary tools known to the engine. The tellask-special virtual tools
/// are not registered here; the driver routes them itself.
pub struct ToolRegistry {
    tools: HashMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>, source: ToolSource) {
        let name = tool.name().to_string();
        self.tools.insert(name, ToolEntry { tool, source });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| Arc::clone(&e.tool))
    }

    pub fn source(&self, name: &str) -> Option<&ToolSource> {
        self.tools.get(name).map(|e| &e.source)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions of the named tools that exist, sorted by name. This is
    /// the projection an agent's generator sees.
    pub fn definitions_for(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = allowed
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|e| e.tool.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs.dedup_by(|a, b| a.name == b.name);
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::Dialog;
    use crate::tools::ToolContext;
    use async_trait::async_trait;
    use dominds_core::tools::{ToolError, ToolOutput};
    use serde_json::Value;

    struct Dummy(&'static str);

    #[async_trait]
    impl Tool for Dummy {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "dummy"
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn call(&self, _: &Arc<Dialog>, _: &ToolContext, _: Value) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text(self.0))
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Dummy("b")), ToolSource::BuiltIn);
        reg.register(Arc::new(Dummy("a")), ToolSource::Custom("ext".into()));
        assert!(reg.contains("a"));
        assert!(reg.get("zzz").is_none());
        assert_eq!(reg.source("a"), Some(&ToolSource::Custom("ext".into())));
        assert_eq!(reg.names(), vec!["a", "b"]);
        assert_eq!(reg.count(), 2);
    }

    #[test]
    fn definitions_project_allowed_tools_only() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Dummy("b")), ToolSource::BuiltIn);
        reg.register(Arc::new(Dummy("a")), ToolSource::BuiltIn);
        reg.register(Arc::new(Dummy("c")), ToolSource::BuiltIn);
        let allowed = vec!["c".to_string(), "a".to_string(), "missing".to_string(), "a".to_string()];
        let names: Vec<String> = reg.definitions_for(&allowed).into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn re_register_replaces() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Dummy("a")), ToolSource::BuiltIn);
        reg.register(Arc::new(Dummy("a")), ToolSource::Custom("x".into()));
        assert_eq!(reg.count(), 1);
        assert_eq!(reg.source("a"), Some(&ToolSource::Custom("x".into())));
    }
}
