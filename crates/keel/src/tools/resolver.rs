//! Building the tool set for a call.
//!
//! [`ToolResolver`] merges the tool sets contributed by extensions (in
//! registration order, later ones overriding earlier ones by name) with the
//! caller's custom tools, which go last and win every collision. The
//! [`ToolPolicy`] then removes blocked tools and applies the whitelist, and
//! every surviving tool is wrapped in a [`ManagedTool`].
//!
//! The wrapped set is cached until the number of registered extensions or
//! custom tools changes. A per-call allow-list produces a filtered view of
//! the cached set; the view itself is never cached.

use crate::agent::hooks::HookComposer;
use crate::tools::core::ToolSet;
use crate::tools::filter::{ApprovalConfig, ToolPolicy};
use crate::tools::managed::{ManagedTool, ToolRuntime};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheKey {
    extensions: usize,
    custom: usize,
}

/// Resolves and caches the engine's tool set.
pub struct ToolResolver {
    runtime: Arc<ToolRuntime>,
    policy: ToolPolicy,
    approval: ApprovalConfig,
    cache: Mutex<Option<(CacheKey, Arc<ToolSet>)>>,
}

impl ToolResolver {
    pub fn new(runtime: Arc<ToolRuntime>, policy: ToolPolicy, approval: ApprovalConfig) -> Self {
        Self {
            runtime,
            policy,
            approval,
            cache: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    /// The wrapped tool set for one call.
    pub fn resolve(
        &self,
        hooks: &HookComposer,
        custom: &ToolSet,
        allow_list: Option<&[String]>,
    ) -> Arc<ToolSet> {
        let key = CacheKey {
            extensions: hooks.len(),
            custom: custom.len(),
        };

        let cached = self
            .cache
            .lock()
            .ok()
            .and_then(|c| c.as_ref().filter(|(k, _)| *k == key).map(|(_, t)| t.clone()));
        let full = match cached {
            Some(tools) => tools,
            None => {
                let tools = Arc::new(self.build(hooks, custom));
                debug!(
                    "Resolved {} tool(s) from {} extension(s) and {} custom tool(s)",
                    tools.len(),
                    key.extensions,
                    key.custom
                );
                if let Ok(mut cache) = self.cache.lock() {
                    *cache = Some((key, tools.clone()));
                }
                tools
            }
        };

        match allow_list {
            Some(names) => Arc::new(full.subset(names.iter().map(String::as_str))),
            None => full,
        }
    }

    fn build(&self, hooks: &HookComposer, custom: &ToolSet) -> ToolSet {
        let mut merged = ToolSet::new();
        for extension in hooks.extensions() {
            merged.merge(&extension.tools());
        }
        merged.merge(custom);
        self.policy.apply(&mut merged);

        let mut wrapped = ToolSet::new();
        for (name, tool) in merged.iter() {
            let rule = self.approval.rule_for(name).cloned();
            wrapped.insert(Arc::new(ManagedTool::new(
                tool.clone(),
                rule,
                self.runtime.clone(),
            )));
        }
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolDef;
    use crate::agent::events::{EventHandler, NoopHandler};
    use crate::agent::extension::Extension;
    use crate::api::retry::RetryConfig;
    use crate::tools::core::{FnTool, ToolOutput};
    use crate::tools::managed::FailureLog;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tool(name: &str, reply: &'static str) -> FnTool {
        FnTool::new(ToolDef::new(name, reply, json!({})), move |_: Value| async move {
            Ok(ToolOutput::text(reply))
        })
    }

    struct Provides {
        set: Vec<(&'static str, &'static str)>,
        calls: Arc<AtomicU32>,
    }

    impl Extension for Provides {
        fn name(&self) -> &str {
            "provides"
        }

        fn tools(&self) -> ToolSet {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut set = ToolSet::new();
            for &(name, reply) in &self.set {
                set.register(tool(name, reply));
            }
            set
        }
    }

    fn setup(policy: ToolPolicy) -> (ToolResolver, HookComposer) {
        let events: Arc<dyn EventHandler> = Arc::new(NoopHandler);
        let hooks = HookComposer::new(events.clone());
        let runtime = Arc::new(ToolRuntime {
            hooks: Arc::new(HookComposer::new(events.clone())),
            events,
            failures: FailureLog::new(),
            retry: RetryConfig::default(),
        });
        (
            ToolResolver::new(runtime, policy, ApprovalConfig::new()),
            hooks,
        )
    }

    fn extension(set: Vec<(&'static str, &'static str)>) -> (Arc<Provides>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Arc::new(Provides {
                set,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    #[tokio::test]
    async fn later_registrations_and_custom_tools_win() {
        let (resolver, hooks) = setup(ToolPolicy::default());
        hooks.register(extension(vec![("read", "first"), ("grep", "grep")]).0);
        hooks.register(extension(vec![("read", "second")]).0);
        let custom = ToolSet::new().with(tool("grep", "custom"));

        let tools = resolver.resolve(&hooks, &custom, None);
        let read = tools.execute("read", "{}").await.unwrap();
        let grep = tools.execute("grep", "{}").await.unwrap();
        assert_eq!(read.content, "second");
        assert_eq!(grep.content, "custom");
    }

    #[test]
    fn blocked_beats_allowed() {
        let policy = ToolPolicy::default()
            .with_allowed(["read", "bash"])
            .with_blocked("bash");
        let (resolver, hooks) = setup(policy);
        hooks.register(extension(vec![("read", "r"), ("bash", "b"), ("grep", "g")]).0);

        let tools = resolver.resolve(&hooks, &ToolSet::new(), None);
        assert_eq!(tools.names().collect::<Vec<_>>(), vec!["read"]);
    }

    #[test]
    fn cache_invalidated_when_registry_grows() {
        let (resolver, hooks) = setup(ToolPolicy::default());
        let (ext, calls) = extension(vec![("read", "r")]);
        hooks.register(ext);

        resolver.resolve(&hooks, &ToolSet::new(), None);
        resolver.resolve(&hooks, &ToolSet::new(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        hooks.register(extension(vec![("grep", "g")]).0);
        let tools = resolver.resolve(&hooks, &ToolSet::new(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(tools.len(), 2);
    }

    #[test]
    fn allow_list_view_is_not_cached() {
        let (resolver, hooks) = setup(ToolPolicy::default());
        let (ext, calls) = extension(vec![("read", "r"), ("grep", "g")]);
        hooks.register(ext);

        let only_read = vec!["read".to_string()];
        let view = resolver.resolve(&hooks, &ToolSet::new(), Some(&only_read));
        assert_eq!(view.names().collect::<Vec<_>>(), vec!["read"]);

        let full = resolver.resolve(&hooks, &ToolSet::new(), None);
        assert_eq!(full.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
