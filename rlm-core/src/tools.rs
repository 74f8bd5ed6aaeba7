//! Host tools callable from sandboxed code via the bridge.

use async_trait::async_trait;
use rlm_common::RlmError;
use rlm_sandbox::protocol::ToolDescriptor;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameter_names(&self) -> Vec<String>;
    async fn call(&self, args: Vec<serde_json::Value>) -> Result<serde_json::Value, RlmError>;
}

/// Resolves bridge method names to handlers. `llm_query` and `budget`
/// are built into the engine and must not be registered here.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Tool surface advertised to guests, built-ins included.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors = vec![
            ToolDescriptor {
                name: "llm_query".to_string(),
                parameter_names: vec!["query".to_string(), "context".to_string()],
                description: "Delegate a sub-problem to another model call".to_string(),
            },
            ToolDescriptor {
                name: "budget".to_string(),
                parameter_names: Vec::new(),
                description: "Remaining iteration, call, token and time budget".to_string(),
            },
        ];
        let mut named: Vec<_> = self.tools.values().collect();
        named.sort_by(|a, b| a.name().cmp(b.name()));
        descriptors.extend(named.into_iter().map(|tool| ToolDescriptor {
            name: tool.name().to_string(),
            parameter_names: tool.parameter_names(),
            description: tool.description().to_string(),
        }));
        descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }
        fn description(&self) -> &str {
            "uppercase a string"
        }
        fn parameter_names(&self) -> Vec<String> {
            vec!["text".to_string()]
        }
        async fn call(&self, args: Vec<serde_json::Value>) -> Result<serde_json::Value, RlmError> {
            let text = args
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| RlmError::sandbox("upper expects a string"))?;
            Ok(serde_json::json!(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn registered_tools_resolve_and_run() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Upper));

        let tool = registry.get("upper").unwrap();
        let result = tool.call(vec![serde_json::json!("abc")]).await.unwrap();
        assert_eq!(result, serde_json::json!("ABC"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn descriptors_lead_with_builtins() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Upper));
        let descriptors = registry.descriptors();
        assert_eq!(descriptors[0].name, "llm_query");
        assert_eq!(descriptors[1].name, "budget");
        assert!(descriptors.iter().any(|d| d.name == "upper"));
    }
}
