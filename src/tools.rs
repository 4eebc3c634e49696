//! Tool modeling: definitions, the name-keyed registry and the router service.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::{util::BoxCloneSyncService, BoxError, Service};

use crate::error::{AgentError, Result, ToolError};
use crate::items::ToolSpec;
use crate::resilience::Resilience;

/// How the loop treats a tool that fails after the resilience stack gave up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Failure fails the run
    #[default]
    Critical,
    /// Failure becomes an error result the model can work around
    Optional,
}

/// Uniform tool invocation passed to routed tool services.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    /// Request the call belongs to; part of the idempotency key
    pub scope: String,
}

/// Uniform tool output produced by tool services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub id: String,
    pub content: String,
}

/// Boxed tool service type alias.
pub type ToolSvc = BoxCloneSyncService<ToolInvocation, ToolOutput, BoxError>;

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, BoxError>> + Send + Sync>;

/// Definition of a tool: the schema advertised to the model, its policy tags and the service.
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
    pub criticality: Criticality,
    /// Wrap calls in the idempotency guard
    pub side_effecting: bool,
    /// Overrides the configured tool timeout
    pub timeout: Option<Duration>,
    pub service: ToolSvc,
}

impl std::fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDef")
            .field("name", &self.name)
            .field("criticality", &self.criticality)
            .field("side_effecting", &self.side_effecting)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// String outputs are passed through, anything else is rendered as JSON.
fn render(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl ToolDef {
    /// Create a tool definition from a handler taking JSON args and returning JSON.
    pub fn from_handler(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
        handler: Handler,
    ) -> Self {
        let name = name.into();
        let expected = name.clone();
        let svc = tower::service_fn(move |inv: ToolInvocation| {
            let handler = handler.clone();
            let expected = expected.clone();
            async move {
                if inv.name != expected {
                    return Err::<ToolOutput, BoxError>(
                        format!("routed to wrong tool: expected={}, got={}", expected, inv.name).into(),
                    );
                }
                let out = (handler)(inv.arguments).await?;
                Ok(ToolOutput {
                    id: inv.id,
                    content: render(out),
                })
            }
        });
        Self::from_service(name, description, parameters_schema, BoxCloneSyncService::new(svc))
    }

    /// Wrap an existing tool service.
    pub fn from_service(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
        service: ToolSvc,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema,
            criticality: Criticality::Critical,
            side_effecting: false,
            timeout: None,
            service,
        }
    }

    pub fn optional(mut self) -> Self {
        self.criticality = Criticality::Optional;
        self
    }

    pub fn side_effecting(mut self) -> Self {
        self.side_effecting = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters_schema.clone(),
        }
    }
}

/// Create a tool from a typed handler.
/// - `A` is the input args struct (Deserialize + JsonSchema)
/// - `R` is the output type (Serialize); strings are returned verbatim
///
/// Arguments that do not deserialize fail with a validation [`ToolError`].
pub fn tool_typed<A, H, Fut, R>(
    name: impl Into<String>,
    description: impl Into<String>,
    handler: H,
) -> ToolDef
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    R: Serialize + Send + 'static,
    H: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
{
    let schema = schemars::schema_for!(A);
    let params = serde_json::to_value(schema.schema)
        .unwrap_or_else(|_| serde_json::json!({ "type": "object" }));
    let handler = Arc::new(handler);
    let erased: Handler = Arc::new(move |raw: Value| {
        let h = handler.clone();
        Box::pin(async move {
            let args: A = serde_json::from_value(raw)
                .map_err(|e| Box::new(ToolError::validation(e.to_string())) as BoxError)?;
            let out: R = (h.as_ref())(args).await?;
            Ok(serde_json::to_value(out)?)
        })
    });
    ToolDef::from_handler(name, description, params, erased)
}

/// Registration-time validated set of tools.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Names must be unique, 1-64 chars of `[A-Za-z0-9_-]`, and the
    /// parameter schema must describe a JSON object.
    pub fn register(&mut self, tool: ToolDef) -> Result<()> {
        let name = tool.name.as_str();
        if name.is_empty()
            || name.len() > 64
            || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(AgentError::Registration(format!("invalid tool name '{name}'")));
        }
        if self.tools.iter().any(|t| t.name == tool.name) {
            return Err(AgentError::Registration(format!("duplicate tool '{name}'")));
        }
        if tool.parameters_schema.get("type").and_then(Value::as_str) != Some("object") {
            return Err(AgentError::Registration(format!(
                "tool '{name}' parameters must be a JSON object schema"
            )));
        }
        self.tools.push(tool);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, tool: ToolDef) -> Result<Self> {
        self.register(tool)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(ToolDef::spec).collect()
    }

    /// Wrap every tool in its resilience stack and build the router.
    pub fn into_router(self, resilience: &Resilience) -> ToolRouter {
        ToolRouter::new(
            self.tools
                .into_iter()
                .map(|mut td| {
                    td.service = resilience.tool_service(&td);
                    td
                })
                .collect(),
        )
    }
}

/// Router service over tools using a name → index table.
#[derive(Clone)]
pub struct ToolRouter {
    name_to_index: Arc<HashMap<String, usize>>,
    services: Vec<ToolSvc>, // index 0 is the unknown-tool fallback
    criticality: Arc<HashMap<String, Criticality>>,
    specs: Arc<Vec<ToolSpec>>,
}

impl ToolRouter {
    pub fn new(tools: Vec<ToolDef>) -> Self {
        let unknown = BoxCloneSyncService::new(tower::service_fn(|inv: ToolInvocation| async move {
            Err::<ToolOutput, BoxError>(Box::new(ToolError::validation(format!(
                "unknown tool: {}",
                inv.name
            ))))
        }));

        let mut services: Vec<ToolSvc> = vec![unknown];
        let mut specs = Vec::with_capacity(tools.len());
        let mut name_to_index = HashMap::new();
        let mut criticality = HashMap::new();

        for (i, td) in tools.into_iter().enumerate() {
            specs.push(td.spec());
            name_to_index.insert(td.name.clone(), i + 1);
            criticality.insert(td.name, td.criticality);
            services.push(td.service);
        }

        Self {
            name_to_index: Arc::new(name_to_index),
            services,
            criticality: Arc::new(criticality),
            specs: Arc::new(specs),
        }
    }

    /// Unknown names are critical.
    pub fn criticality(&self, name: &str) -> Criticality {
        self.criticality.get(name).copied().unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }
}

impl Service<ToolInvocation> for ToolRouter {
    type Response = ToolOutput;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        // readiness is checked per selected service inside `call`
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolInvocation) -> Self::Future {
        let idx = self
            .name_to_index
            .get(req.name.as_str())
            .copied()
            .unwrap_or(0);
        let svc = self.services[idx].clone();
        Box::pin(tower::ServiceExt::oneshot(svc, req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolErrorClass;
    use serde_json::json;
    use tower::ServiceExt;

    #[derive(Deserialize, JsonSchema)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    fn add_tool() -> ToolDef {
        tool_typed("add", "Add two integers", |args: AddArgs| async move {
            Ok::<_, BoxError>(args.a + args.b)
        })
    }

    fn invocation(name: &str, arguments: Value) -> ToolInvocation {
        ToolInvocation {
            id: "call_1".into(),
            name: name.into(),
            arguments,
            scope: "test".into(),
        }
    }

    #[tokio::test]
    async fn typed_tool_renders_output() {
        let router = ToolRouter::new(vec![add_tool()]);
        let out = router
            .oneshot(invocation("add", json!({"a": 2, "b": 3})))
            .await
            .unwrap();
        assert_eq!(out.id, "call_1");
        assert_eq!(out.content, "5");
    }

    #[tokio::test]
    async fn bad_arguments_are_validation_errors() {
        let router = ToolRouter::new(vec![add_tool()]);
        let err = router
            .oneshot(invocation("add", json!({"a": "two"})))
            .await
            .unwrap_err();
        let tool_err = err.downcast_ref::<ToolError>().unwrap();
        assert_eq!(tool_err.class, ToolErrorClass::Validation);
    }

    #[tokio::test]
    async fn unknown_tools_hit_the_fallback() {
        let router = ToolRouter::new(vec![add_tool()]);
        assert_eq!(router.criticality("nope"), Criticality::Critical);
        let err = router
            .oneshot(invocation("nope", json!({})))
            .await
            .unwrap_err();
        let tool_err = err.downcast_ref::<ToolError>().unwrap();
        assert_eq!(tool_err.class, ToolErrorClass::Validation);
        assert!(tool_err.message.contains("nope"));
    }

    #[test]
    fn registry_rejects_bad_definitions() {
        let mut reg = ToolRegistry::new();
        reg.register(add_tool()).unwrap();
        assert!(matches!(reg.register(add_tool()), Err(AgentError::Registration(_))));

        let bad_name = ToolDef::from_service(
            "has space",
            "x",
            json!({"type": "object"}),
            BoxCloneSyncService::new(tower::service_fn(|inv: ToolInvocation| async move {
                Ok::<_, BoxError>(ToolOutput { id: inv.id, content: String::new() })
            })),
        );
        assert!(reg.register(bad_name).is_err());

        let bad_schema = tool_typed("echo", "Echo", |s: String| async move { Ok::<_, BoxError>(s) });
        assert!(reg.register(bad_schema).is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn tags_and_specs() {
        let td = add_tool().optional().side_effecting().timeout(Duration::from_secs(2));
        assert_eq!(td.criticality, Criticality::Optional);
        assert!(td.side_effecting);
        let spec = td.spec();
        assert_eq!(spec.name, "add");
        assert_eq!(spec.parameters["type"], "object");
        assert!(spec.parameters["properties"].get("a").is_some());
    }
}
