//! Allow/block filtering and approval policy for resolved tools.
//!
//! [`ToolPolicy`] is the serializable part of the tool configuration: an
//! optional whitelist, a blocklist that always wins over it, the names that
//! need approval and the retry backoff. Per-name predicates over call
//! arguments can only be set in code, through
//! [`ApprovalConfig::with_predicate`].

use crate::api::retry::RetryConfig;
use crate::tools::core::ToolSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Predicate deciding from the call arguments whether approval is needed.
pub type ApprovalPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Whether a single tool needs approval.
#[derive(Clone)]
pub enum ApprovalRule {
    Always,
    Never,
    When(ApprovalPredicate),
}

impl ApprovalRule {
    pub fn requires_approval(&self, arguments: &Value) -> bool {
        match self {
            ApprovalRule::Always => true,
            ApprovalRule::Never => false,
            ApprovalRule::When(predicate) => predicate(arguments),
        }
    }
}

impl fmt::Debug for ApprovalRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalRule::Always => f.write_str("Always"),
            ApprovalRule::Never => f.write_str("Never"),
            ApprovalRule::When(_) => f.write_str("When(<predicate>)"),
        }
    }
}

/// Per-tool approval rules. Tools without a rule run without approval.
#[derive(Debug, Clone, Default)]
pub struct ApprovalConfig {
    rules: HashMap<String, ApprovalRule>,
}

impl ApprovalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every named tool always requires approval.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rules = names
            .into_iter()
            .map(|n| (n.into(), ApprovalRule::Always))
            .collect();
        Self { rules }
    }

    pub fn with_rule(mut self, tool: impl Into<String>, rule: ApprovalRule) -> Self {
        self.rules.insert(tool.into(), rule);
        self
    }

    pub fn with_flag(self, tool: impl Into<String>, required: bool) -> Self {
        let rule = if required {
            ApprovalRule::Always
        } else {
            ApprovalRule::Never
        };
        self.with_rule(tool, rule)
    }

    pub fn with_predicate(
        self,
        tool: impl Into<String>,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.with_rule(tool, ApprovalRule::When(Arc::new(predicate)))
    }

    /// Merge `other` in; its rules win on name collision.
    pub fn merge(&mut self, other: ApprovalConfig) {
        self.rules.extend(other.rules);
    }

    pub fn rule_for(&self, tool: &str) -> Option<&ApprovalRule> {
        self.rules.get(tool)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Approval as written in a config file: a list of names, or a map from
/// name to a boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApprovalSpec {
    Names(Vec<String>),
    Flags(BTreeMap<String, bool>),
}

impl Default for ApprovalSpec {
    fn default() -> Self {
        ApprovalSpec::Names(Vec::new())
    }
}

impl From<&ApprovalSpec> for ApprovalConfig {
    fn from(spec: &ApprovalSpec) -> Self {
        match spec {
            ApprovalSpec::Names(names) => ApprovalConfig::from_names(names.iter().cloned()),
            ApprovalSpec::Flags(flags) => flags
                .iter()
                .fold(ApprovalConfig::new(), |acc, (name, required)| {
                    acc.with_flag(name.clone(), *required)
                }),
        }
    }
}

/// Which tools the model may see, and how they are run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPolicy {
    /// Strict whitelist. `None` allows every tool that isn't blocked.
    pub allowed: Option<Vec<String>>,
    /// Always removed, even when whitelisted.
    pub blocked: Vec<String>,
    pub approval: ApprovalSpec,
    /// Backoff for failed tool executions.
    pub retry: RetryConfig,
}

impl ToolPolicy {
    pub fn with_allowed<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_blocked(mut self, name: impl Into<String>) -> Self {
        self.blocked.push(name.into());
        self
    }

    pub fn is_permitted(&self, name: &str) -> bool {
        if self.blocked.iter().any(|b| b == name) {
            return false;
        }
        match &self.allowed {
            Some(allowed) => allowed.iter().any(|a| a == name),
            None => true,
        }
    }

    /// Remove every tool this policy doesn't permit.
    pub fn apply(&self, tools: &mut ToolSet) {
        let before = tools.len();
        tools.retain(|name| self.is_permitted(name));
        if tools.len() < before {
            debug!("Tool policy removed {} tool(s)", before - tools.len());
        }
    }
}
