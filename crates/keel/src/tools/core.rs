//! Tool abstraction for LLM function-calling agents.
//!
//! The [`Tool`] trait defines the interface that every tool must implement:
//! a static API definition (name, description, JSON schema) and an async
//! `execute` method over parsed JSON arguments. Tools are collected into a
//! [`ToolSet`] which handles definition export and dispatch by name.

use crate::ToolDef;
use crate::error::ToolError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + 'a>>;

/// What a tool hands back to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    /// Structured failure flag. `None` leaves classification to the
    /// text heuristic.
    pub is_error: Option<bool>,
}

impl ToolOutput {
    /// A successful result.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: Some(false),
        }
    }

    /// A result the tool itself reports as a failure, without raising an
    /// error. Not retried.
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: Some(true),
        }
    }

    /// A result with no structured success signal.
    pub fn unflagged(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: None,
        }
    }
}

impl From<String> for ToolOutput {
    fn from(content: String) -> Self {
        ToolOutput::unflagged(content)
    }
}

/// A capability the model can call.
///
/// # Example
///
/// ```ignore
/// struct ReadFile { workdir: PathBuf }
///
/// impl Tool for ReadFile {
///     fn definition(&self) -> ToolDef {
///         ToolDef::new("readFile", "Read a file", json_schema_for::<ReadFileArgs>())
///     }
///
///     fn execute(&self, arguments: Value) -> ToolFuture<'_> {
///         Box::pin(async move {
///             let args: ReadFileArgs = parse_tool_args(&arguments)?;
///             let body = tokio::fs::read_to_string(self.workdir.join(&args.path))
///                 .await
///                 .map_err(|e| ToolError::Failed(e.to_string()))?;
///             Ok(ToolOutput::text(body))
///         })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    /// The tool definition sent to the model.
    fn definition(&self) -> ToolDef;

    /// Execute the tool with parsed JSON arguments.
    ///
    /// Return `Err` for failures worth retrying; return
    /// [`ToolOutput::error`] for failures the model should simply see.
    fn execute(&self, arguments: Value) -> ToolFuture<'_>;

    /// The tool's name (convenience, delegates to definition).
    fn name(&self) -> String {
        self.definition().function.name
    }
}

// ── ToolSet ────────────────────────────────────────────────────────

/// A collection of tools dispatched by name.
///
/// Cloning is cheap: tools are shared behind `Arc`s. Iteration order (and
/// therefore definition order sent to the model) is by name.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.insert(Arc::new(tool));
    }

    /// Register a shared tool, replacing any tool with the same name.
    pub fn insert(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        if self.tools.insert(name.clone(), tool).is_some() {
            debug!("Tool {name} overrides an earlier registration");
        }
    }

    /// Register a tool (builder pattern).
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Merge `other` into this set; tools in `other` win on name collision.
    pub fn merge(&mut self, other: &ToolSet) {
        for tool in other.tools.values() {
            self.insert(tool.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    /// Keep only the tools for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.tools.retain(|name, _| keep(name));
    }

    /// A new set containing only the named tools that exist here.
    pub fn subset<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> ToolSet {
        let tools = names
            .into_iter()
            .filter_map(|n| self.tools.get_key_value(n))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ToolSet { tools }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Tool>)> {
        self.tools.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Get tool definitions to send to the model.
    pub fn definitions(&self) -> Vec<ToolDef> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name with its raw JSON argument string.
    pub async fn execute(&self, name: &str, arguments: &str) -> Result<ToolOutput, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::Unknown {
            tool: name.to_string(),
        })?;
        let args = parse_arguments(name, arguments)?;

        log_tool_call(name, arguments);
        let start = std::time::Instant::now();
        let result = tool.execute(args).await;
        debug!(
            "Tool {name} completed in {:.0}ms ({})",
            start.elapsed().as_secs_f64() * 1000.0,
            match &result {
                Ok(out) => format!("{} bytes", out.content.len()),
                Err(e) => format!("error: {e}"),
            }
        );
        result
    }
}

// ── FnTool ────────────────────────────────────────────────────────

/// Type-erased async handler for [`FnTool`].
type ErasedToolHandler = Box<dyn Fn(Value) -> ToolFuture<'static> + Send + Sync>;

/// A closure-based tool that auto-parses arguments and delegates to a handler.
///
/// Use [`FnTool`] for stateless tools. For tools that need shared state,
/// define a struct and implement the [`Tool`] trait directly.
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct SearchArgs { query: String }
///
/// let tool = FnTool::new(
///     ToolDef::new("search", "Search the knowledge base", json_schema_for::<SearchArgs>()),
///     |args: SearchArgs| async move {
///         Ok(ToolOutput::text(format!("no results for {}", args.query)))
///     },
/// );
/// ```
pub struct FnTool {
    def: ToolDef,
    handler: ErasedToolHandler,
}

impl FnTool {
    /// Create a new closure-based tool. Arguments that don't deserialize
    /// into `A` fail with [`ToolError::InvalidArguments`].
    pub fn new<A, F, Fut>(def: ToolDef, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        let name = def.function.name.clone();
        let erased = move |raw: Value| -> ToolFuture<'static> {
            match serde_json::from_value::<A>(raw) {
                Ok(args) => Box::pin(handler(args)),
                Err(e) => {
                    let err = ToolError::InvalidArguments {
                        tool: name.clone(),
                        reason: e.to_string(),
                    };
                    Box::pin(async move { Err(err) })
                }
            }
        };

        Self {
            def,
            handler: Box::new(erased),
        }
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute(&self, arguments: Value) -> ToolFuture<'_> {
        (self.handler)(arguments)
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.def.function.name)
            .finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Parse a raw argument string. An empty string means no arguments.
pub fn parse_arguments(tool: &str, arguments: &str) -> Result<Value, ToolError> {
    if arguments.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(arguments).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        reason: format!("invalid JSON: {e}"),
    })
}

/// Deserialize parsed arguments into a typed struct.
pub fn parse_tool_args<T: serde::de::DeserializeOwned>(arguments: &Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments.clone())
        .map_err(|e| ToolError::Failed(format!("invalid tool arguments: {e}")))
}

/// Validate arguments against a tool's declared JSON Schema.
///
/// A schema that fails to compile skips validation.
pub fn validate_tool_arguments(def: &ToolDef, arguments: &Value) -> Result<(), ToolError> {
    let validator = match jsonschema::validator_for(&def.function.parameters) {
        Ok(v) => v,
        Err(_) => return Ok(()),
    };

    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments {
            tool: def.function.name.clone(),
            reason: errors.join("; "),
        })
    }
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.len() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} arguments: {arguments}");
}
