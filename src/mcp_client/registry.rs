//! Tool registry — per-connection cache of discovered tool definitions.
//!
//! Provides:
//! - One-shot discovery via `tools/list`, following `nextCursor` pages
//! - Lookup by tool name
//! - A stale flag raised by `notifications/tools/list_changed`
//!
//! Concurrent discovers share a single fetch. The cached list is only
//! replaced after an explicit `invalidate()`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::json;
use tokio::sync::Mutex;

use super::connection::Connection;
use super::errors::McpError;
use super::types::{ListToolsResult, ToolDefinition};

/// Upper bound on `tools/list` pages followed in one discovery.
const MAX_PAGES: usize = 1000;

/// Discovered tools in server order, indexed by name.
#[derive(Debug)]
pub struct ToolSet {
    tools: Vec<ToolDefinition>,
    index: HashMap<String, usize>,
}

impl ToolSet {
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Tool cache for one connection.
#[derive(Debug)]
pub struct ToolRegistry {
    server: String,
    cache: RwLock<Option<Arc<ToolSet>>>,
    fetch_gate: Mutex<()>,
    stale: AtomicBool,
}

impl ToolRegistry {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            cache: RwLock::new(None),
            fetch_gate: Mutex::new(()),
            stale: AtomicBool::new(false),
        }
    }

    /// Fetch the tool list over `connection` unless already cached.
    pub async fn discover(&self, connection: &Connection) -> Result<Arc<ToolSet>, McpError> {
        self.discover_with(|cursor| async move {
            let params = cursor.map(|c| json!({ "cursor": c }));
            let raw = connection.send("tools/list", params, None).await?;
            serde_json::from_value::<ListToolsResult>(raw).map_err(|e| McpError::ProtocolError {
                server: connection.name().to_string(),
                reason: format!("invalid tools/list result: {e}"),
            })
        })
        .await
    }

    /// Discovery with an arbitrary page fetcher.
    pub async fn discover_with<F, Fut>(&self, mut fetch: F) -> Result<Arc<ToolSet>, McpError>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = Result<ListToolsResult, McpError>>,
    {
        if let Some(cached) = self.cached() {
            return Ok(cached);
        }
        let _gate = self.fetch_gate.lock().await;
        // Another caller may have finished the fetch while we waited.
        if let Some(cached) = self.cached() {
            return Ok(cached);
        }

        let mut tools = Vec::new();
        let mut index = HashMap::new();
        let mut cursors = HashSet::new();
        let mut cursor: Option<String> = None;
        for page_no in 0.. {
            if page_no >= MAX_PAGES {
                return Err(self.protocol_error(format!(
                    "tools/list exceeded {MAX_PAGES} pages"
                )));
            }
            let page = fetch(cursor.take()).await?;
            for tool in page.tools {
                if index.insert(tool.name.clone(), tools.len()).is_some() {
                    return Err(self.protocol_error(format!(
                        "server listed tool '{}' more than once",
                        tool.name
                    )));
                }
                tools.push(tool);
            }
            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => {
                    if !cursors.insert(next.clone()) {
                        return Err(self.protocol_error(format!(
                            "tools/list returned cursor '{next}' twice"
                        )));
                    }
                    cursor = Some(next);
                }
                None => break,
            }
        }

        let set = Arc::new(ToolSet { tools, index });
        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(set.clone());
        }
        self.stale.store(false, Ordering::SeqCst);
        tracing::info!(server = %self.server, tools = set.len(), "discovered MCP tools");
        Ok(set)
    }

    /// The cached tool set, if discovery has run.
    pub fn cached(&self) -> Option<Arc<ToolSet>> {
        self.cache.read().ok().and_then(|cache| cache.clone())
    }

    /// Look up a cached definition.
    pub fn lookup(&self, name: &str) -> Result<ToolDefinition, McpError> {
        self.cached()
            .and_then(|set| set.get(name).cloned())
            .ok_or_else(|| McpError::UnknownTool {
                name: name.to_string(),
            })
    }

    /// Cached tool names in server order.
    pub fn tool_names(&self) -> Vec<String> {
        self.cached()
            .map(|set| set.tools.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Drop the cache so the next discover re-fetches.
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.write() {
            *cache = None;
        }
        self.stale.store(false, Ordering::SeqCst);
    }

    /// Record that the server announced a changed tool list.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// True after a `list_changed` notification until the next discovery.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    fn protocol_error(&self, reason: String) -> McpError {
        McpError::ProtocolError {
            server: self.server.clone(),
            reason,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: format!("{name} tool"),
            input_schema: Value::Null,
        }
    }

    fn page(names: &[&str], next: Option<&str>) -> ListToolsResult {
        ListToolsResult {
            tools: names.iter().map(|n| tool(n)).collect(),
            next_cursor: next.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_discover_caches_identical_sequence() {
        let registry = ToolRegistry::new("aws");
        let calls = AtomicUsize::new(0);
        let fetch = |_cursor: Option<String>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, McpError>(page(&["b", "a"], None)) }
        };

        let first = registry.discover_with(fetch).await.unwrap();
        let second = registry
            .discover_with(|_| async { Ok::<_, McpError>(page(&["other"], None)) })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.tool_names(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_discover_follows_cursors() {
        let registry = ToolRegistry::new("aws");
        let set = registry
            .discover_with(|cursor| async move {
                Ok::<_, McpError>(match cursor.as_deref() {
                    None => page(&["a", "b"], Some("p2")),
                    Some("p2") => page(&["c"], Some("p3")),
                    _ => page(&["d"], None),
                })
            })
            .await
            .unwrap();
        let names: Vec<_> = set.tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_duplicate_names_are_protocol_error() {
        let registry = ToolRegistry::new("aws");
        let err = registry
            .discover_with(|_| async { Ok::<_, McpError>(page(&["a", "a"], None)) })
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ProtocolError { .. }));
        assert!(registry.cached().is_none());
    }

    #[tokio::test]
    async fn test_repeated_cursor_is_protocol_error() {
        let registry = ToolRegistry::new("aws");
        let err = registry
            .discover_with(|_| async { Ok::<_, McpError>(page(&[], Some("again"))) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("again"));
    }

    #[tokio::test]
    async fn test_concurrent_discovers_share_one_fetch() {
        let registry = Arc::new(ToolRegistry::new("aws"));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .discover_with(|_| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<_, McpError>(page(&["a"], None))
                        }
                    })
                    .await
                    .unwrap()
            }));
        }
        let sets: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sets.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_lookup_and_invalidate() {
        let registry = ToolRegistry::new("aws");
        let err = registry.lookup("a").unwrap_err();
        assert_eq!(err.to_string(), "Tool 'a' not found");

        registry
            .discover_with(|_| async { Ok::<_, McpError>(page(&["a"], None)) })
            .await
            .unwrap();
        assert_eq!(registry.lookup("a").unwrap().description, "a tool");
        assert_eq!(
            registry.lookup("nope").unwrap_err().to_string(),
            "Tool 'nope' not found"
        );

        registry.mark_stale();
        assert!(registry.is_stale());
        // Stale alone never triggers a refetch.
        assert!(registry.cached().is_some());

        registry.invalidate();
        assert!(registry.cached().is_none());
        assert!(!registry.is_stale());
        registry
            .discover_with(|_| async { Ok::<_, McpError>(page(&["z"], None)) })
            .await
            .unwrap();
        assert_eq!(registry.tool_names(), vec!["z"]);
    }
}
