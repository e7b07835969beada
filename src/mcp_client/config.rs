//! Server manifest and connection options.
//!
//! The manifest is a JSON object mapping server names to entries. Each entry
//! is either a stdio command or an HTTP endpoint. [`ConnectionOptions`] carry
//! the per-run overrides and are merged on top of the entry by
//! [`ConnectionOptions::resolve`], producing [`ConnectionSettings`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::codec::Framing;
use super::errors::McpError;
use super::validator::ValidationMode;

// ─── Defaults ────────────────────────────────────────────────────────────────

pub const DEFAULT_MANIFEST_PATH: &str = "/opt/mcp/mcpservers.json";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 4;

// ─── Manifest ────────────────────────────────────────────────────────────────

/// Parsed manifest file. Entries are kept as raw JSON until one is selected
/// so that a malformed entry only fails the server that uses it.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    servers: BTreeMap<String, Value>,
}

impl Manifest {
    /// Load and parse a manifest, interpolating `${VAR}` references.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        if !path.exists() {
            return Err(config_error(format!(
                "MCP manifest not found at {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            config_error(format!(
                "failed to read MCP manifest {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, McpError> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| config_error(format!("failed to parse MCP manifest JSON: {e}")))?;
        let Value::Object(map) = value else {
            return Err(config_error(
                "failed to parse MCP manifest JSON: top level must be an object",
            ));
        };
        let servers = map
            .into_iter()
            .map(|(name, entry)| (name, interpolate_value(entry)))
            .collect();
        Ok(Self { servers })
    }

    pub fn server_names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// Select and type-check one entry.
    pub fn server(&self, name: &str) -> Result<ServerManifestEntry, McpError> {
        let raw = self
            .servers
            .get(name)
            .ok_or_else(|| config_error(format!("MCP server '{name}' not found in manifest")))?;
        ServerManifestEntry::from_json(name, raw)
    }
}

/// Wire shape of a manifest entry. Unknown keys (`description`, `package`,
/// ...) are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntry {
    #[serde(default, rename = "type", alias = "transport")]
    kind: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    framing: Option<Framing>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    bearer_token: Option<String>,
    #[serde(default)]
    tls_verify: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportKind {
    Stdio,
    Http,
}

/// One configured MCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerManifestEntry {
    Stdio(StdioServerConfig),
    Http(HttpServerConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub framing: Framing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpServerConfig {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub bearer_token: Option<String>,
    pub tls_verify: Option<bool>,
}

impl ServerManifestEntry {
    pub fn from_json(name: &str, value: &Value) -> Result<Self, McpError> {
        let raw: RawEntry = serde_json::from_value(value.clone())
            .map_err(|e| config_error(format!("invalid manifest entry for '{name}': {e}")))?;

        let declared = match raw.kind.as_deref() {
            None => None,
            Some("stdio") => Some(TransportKind::Stdio),
            Some("http" | "streamable-http" | "streamable_http") => Some(TransportKind::Http),
            Some(other) => {
                return Err(config_error(format!(
                    "Invalid transport type '{other}' for server '{name}'"
                )))
            }
        };

        let kind = match (declared, raw.command.is_some(), raw.url.is_some()) {
            (_, true, true) => {
                return Err(config_error(format!(
                    "Manifest for '{name}' sets both 'command' and 'url'"
                )))
            }
            (Some(kind), _, _) => kind,
            (None, true, false) => TransportKind::Stdio,
            (None, false, true) => TransportKind::Http,
            (None, false, false) => {
                return Err(config_error(format!(
                    "Manifest for '{name}' has neither 'command' nor 'url'"
                )))
            }
        };

        match kind {
            TransportKind::Stdio => {
                let command = raw.command.filter(|c| !c.is_empty()).ok_or_else(|| {
                    config_error(format!(
                        "Manifest for '{name}' missing 'command' for stdio transport"
                    ))
                })?;
                Ok(Self::Stdio(StdioServerConfig {
                    command,
                    args: raw.args,
                    env: raw.env,
                    framing: raw.framing.unwrap_or_default(),
                }))
            }
            TransportKind::Http => {
                let url = raw.url.filter(|u| !u.is_empty()).ok_or_else(|| {
                    config_error(format!(
                        "Manifest for '{name}' missing 'url' for http transport"
                    ))
                })?;
                Ok(Self::Http(HttpServerConfig {
                    url,
                    headers: raw.headers,
                    bearer_token: raw.bearer_token,
                    tls_verify: raw.tls_verify,
                }))
            }
        }
    }

    pub fn transport_name(&self) -> &'static str {
        match self {
            Self::Stdio(_) => "stdio",
            Self::Http(_) => "http",
        }
    }

    pub fn is_stdio(&self) -> bool {
        matches!(self, Self::Stdio(_))
    }
}

// ─── Connection Options ──────────────────────────────────────────────────────

/// Per-run options supplied by the caller.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub server_name: String,
    pub manifest_path: PathBuf,
    pub bearer_token: Option<String>,
    pub validate_certs: Option<bool>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub shutdown_grace: Duration,
    pub server_args: Vec<String>,
    pub server_env: BTreeMap<String, String>,
    pub max_concurrent_requests: usize,
    pub validation_mode: ValidationMode,
    pub log_messages: bool,
}

impl ConnectionOptions {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            manifest_path: PathBuf::from(DEFAULT_MANIFEST_PATH),
            bearer_token: None,
            validate_certs: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            server_args: Vec::new(),
            server_env: BTreeMap::new(),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            validation_mode: ValidationMode::default(),
            log_messages: false,
        }
    }

    /// Build options from `MCP_*` environment variables.
    pub fn from_env(server_name: impl Into<String>) -> Result<Self, McpError> {
        Self::from_lookup(server_name, |key| std::env::var(key).ok())
    }

    fn from_lookup<F>(server_name: impl Into<String>, lookup: F) -> Result<Self, McpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::new(server_name);
        if let Some(path) = lookup("MCP_MANIFEST_PATH").filter(|p| !p.is_empty()) {
            options.manifest_path = PathBuf::from(path);
        }
        if let Some(token) = lookup("MCP_BEARER_TOKEN").filter(|t| !t.is_empty()) {
            options.bearer_token = Some(token);
        }
        if let Some(raw) = lookup("MCP_VALIDATE_CERTS") {
            options.validate_certs = Some(parse_bool("MCP_VALIDATE_CERTS", &raw)?);
        }
        if let Some(raw) = lookup("MCP_CONNECT_TIMEOUT") {
            options.connect_timeout = parse_secs("MCP_CONNECT_TIMEOUT", &raw)?;
        }
        if let Some(raw) = lookup("MCP_COMMAND_TIMEOUT") {
            options.command_timeout = parse_secs("MCP_COMMAND_TIMEOUT", &raw)?;
        }
        if let Some(raw) = lookup("MCP_MAX_CONCURRENT_REQUESTS") {
            options.max_concurrent_requests = raw.trim().parse().map_err(|_| {
                config_error(format!(
                    "MCP_MAX_CONCURRENT_REQUESTS must be a positive integer, got '{raw}'"
                ))
            })?;
        }
        if let Some(raw) = lookup("MCP_LOG_MESSAGES") {
            options.log_messages = parse_bool("MCP_LOG_MESSAGES", &raw)?;
        }
        options.check()?;
        Ok(options)
    }

    pub fn with_manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = path.into();
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_validate_certs(mut self, validate: bool) -> Self {
        self.validate_certs = Some(validate);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_server_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.server_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_server_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.server_env.insert(key.into(), value.into());
        self
    }

    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    pub fn with_log_messages(mut self, enabled: bool) -> Self {
        self.log_messages = enabled;
        self
    }

    fn check(&self) -> Result<(), McpError> {
        if self.server_name.is_empty() {
            return Err(config_error("server_name must not be empty"));
        }
        if self.max_concurrent_requests == 0 {
            return Err(config_error("max_concurrent_requests must be at least 1"));
        }
        if self.connect_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(config_error("timeouts must be greater than zero"));
        }
        Ok(())
    }

    /// Load the manifest and merge the selected entry with these options.
    pub fn resolve(&self) -> Result<ConnectionSettings, McpError> {
        let manifest = Manifest::load(&self.manifest_path)?;
        self.resolve_with(&manifest)
    }

    pub fn resolve_with(&self, manifest: &Manifest) -> Result<ConnectionSettings, McpError> {
        self.check()?;
        let entry = match manifest.server(&self.server_name)? {
            ServerManifestEntry::Stdio(mut stdio) => {
                stdio.args.extend(self.server_args.iter().cloned());
                stdio
                    .env
                    .extend(self.server_env.iter().map(|(k, v)| (k.clone(), v.clone())));
                ServerManifestEntry::Stdio(stdio)
            }
            ServerManifestEntry::Http(mut http) => {
                if self.bearer_token.is_some() {
                    http.bearer_token = self.bearer_token.clone();
                }
                http.tls_verify = Some(self.validate_certs.or(http.tls_verify).unwrap_or(true));
                ServerManifestEntry::Http(http)
            }
        };

        Ok(ConnectionSettings {
            server_name: self.server_name.clone(),
            entry,
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
            shutdown_grace: self.shutdown_grace,
            max_concurrent_requests: self.max_concurrent_requests,
            validation_mode: self.validation_mode,
            log_messages: self.log_messages,
        })
    }
}

/// Effective configuration for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub server_name: String,
    pub entry: ServerManifestEntry,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_concurrent_requests: usize,
    pub validation_mode: ValidationMode,
    pub log_messages: bool,
}

impl ConnectionSettings {
    /// Settings with default knobs for an already-selected entry.
    pub fn new(server_name: impl Into<String>, entry: ServerManifestEntry) -> Self {
        Self {
            server_name: server_name.into(),
            entry,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            validation_mode: ValidationMode::default(),
            log_messages: false,
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn config_error(reason: impl Into<String>) -> McpError {
    McpError::ConfigError {
        reason: reason.into(),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, McpError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(config_error(format!("{key} must be a boolean, got '{raw}'"))),
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration, McpError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| config_error(format!("{key} must be a positive number of seconds, got '{raw}'")))
}

fn interpolate_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate_env_vars(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(interpolate_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, interpolate_value(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                expr.push(c);
            }
            result.push_str(&resolve_var_expr(&expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;

    const MANIFEST: &str = r#"{
        "iam": {
            "command": "uvx",
            "args": ["awslabs.iam-mcp-server"],
            "package": "awslabs.iam-mcp-server"
        },
        "github": {
            "type": "stdio",
            "command": "/opt/mcp/bin/github-mcp-server",
            "args": ["stdio"],
            "env": {"GITHUB_HOST": "github.com"},
            "description": "GitHub MCP Server"
        },
        "remote": {"args": [], "type": "http", "url": "https://example.com/mcp", "tlsVerify": false},
        "framed": {"command": "srv", "framing": "content-length"}
    }"#;

    fn write_manifest(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_manifest_and_select_entries() {
        let file = write_manifest(MANIFEST);
        let manifest = Manifest::load(file.path()).unwrap();
        assert_eq!(
            manifest.server_names().collect::<Vec<_>>(),
            vec!["framed", "github", "iam", "remote"]
        );

        match manifest.server("iam").unwrap() {
            ServerManifestEntry::Stdio(cfg) => {
                assert_eq!(cfg.command, "uvx");
                assert_eq!(cfg.framing, Framing::NewlineDelimited);
            }
            other => panic!("expected stdio, got {other:?}"),
        }
        match manifest.server("remote").unwrap() {
            ServerManifestEntry::Http(cfg) => {
                assert_eq!(cfg.url, "https://example.com/mcp");
                assert_eq!(cfg.tls_verify, Some(false));
            }
            other => panic!("expected http, got {other:?}"),
        }
        match manifest.server("framed").unwrap() {
            ServerManifestEntry::Stdio(cfg) => assert_eq!(cfg.framing, Framing::ContentLength),
            other => panic!("expected stdio, got {other:?}"),
        }
    }

    #[test]
    fn test_manifest_errors() {
        let err = Manifest::load(Path::new("/nonexistent/mcpservers.json")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "config error: MCP manifest not found at /nonexistent/mcpservers.json"
        );

        let file = write_manifest("{invalid json");
        let err = Manifest::load(file.path()).unwrap_err();
        assert!(err
            .to_string()
            .contains("failed to parse MCP manifest JSON"));

        let manifest = Manifest::parse("{}").unwrap();
        let err = manifest.server("missing").unwrap_err();
        assert_eq!(
            err.to_string(),
            "config error: MCP server 'missing' not found in manifest"
        );
    }

    #[test]
    fn test_entry_shape_errors() {
        let err = ServerManifestEntry::from_json("x", &json!({"type": "websocket", "url": "ws://h"}))
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Invalid transport type 'websocket' for server 'x'"));

        let err =
            ServerManifestEntry::from_json("x", &json!({"command": "a", "url": "http://h"})).unwrap_err();
        assert!(err.to_string().contains("both"));

        let err = ServerManifestEntry::from_json("x", &json!({"args": []})).unwrap_err();
        assert!(err.to_string().contains("neither"));

        let err = ServerManifestEntry::from_json("x", &json!({"type": "stdio", "url": "http://h"}))
            .unwrap_err();
        assert!(err.to_string().contains("missing 'command'"));

        let entry = ServerManifestEntry::from_json(
            "x",
            &json!({"transport": "streamable-http", "url": "http://h/mcp"}),
        )
        .unwrap();
        assert_eq!(entry.transport_name(), "http");
    }

    #[test]
    fn test_resolve_merges_stdio_overrides() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        let settings = ConnectionOptions::new("github")
            .with_server_args(["--mock"])
            .with_server_env("GITHUB_HOST", "ghe.example.com")
            .with_server_env("FOO", "BAR")
            .resolve_with(&manifest)
            .unwrap();
        let ServerManifestEntry::Stdio(cfg) = settings.entry else {
            panic!("expected stdio");
        };
        assert_eq!(cfg.args, vec!["stdio", "--mock"]);
        assert_eq!(cfg.env["GITHUB_HOST"], "ghe.example.com");
        assert_eq!(cfg.env["FOO"], "BAR");
    }

    #[test]
    fn test_resolve_http_token_and_tls() {
        let manifest = Manifest::parse(MANIFEST).unwrap();

        let settings = ConnectionOptions::new("remote").resolve_with(&manifest).unwrap();
        let ServerManifestEntry::Http(cfg) = settings.entry else {
            panic!("expected http");
        };
        assert_eq!(cfg.tls_verify, Some(false));
        assert!(cfg.bearer_token.is_none());

        let settings = ConnectionOptions::new("remote")
            .with_validate_certs(true)
            .with_bearer_token("token123")
            .resolve_with(&manifest)
            .unwrap();
        let ServerManifestEntry::Http(cfg) = settings.entry else {
            panic!("expected http");
        };
        assert_eq!(cfg.tls_verify, Some(true));
        assert_eq!(cfg.bearer_token.as_deref(), Some("token123"));

        let manifest = Manifest::parse(r#"{"r": {"url": "https://h/mcp"}}"#).unwrap();
        let settings = ConnectionOptions::new("r").resolve_with(&manifest).unwrap();
        let ServerManifestEntry::Http(cfg) = settings.entry else {
            panic!("expected http");
        };
        assert_eq!(cfg.tls_verify, Some(true));
    }

    #[test]
    fn test_options_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MCP_MANIFEST_PATH", "/tmp/m.json"),
            ("MCP_VALIDATE_CERTS", "false"),
            ("MCP_COMMAND_TIMEOUT", "2.5"),
            ("MCP_MAX_CONCURRENT_REQUESTS", "8"),
            ("MCP_LOG_MESSAGES", "yes"),
        ]);
        let options =
            ConnectionOptions::from_lookup("aws", |k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(options.manifest_path, PathBuf::from("/tmp/m.json"));
        assert_eq!(options.validate_certs, Some(false));
        assert_eq!(options.command_timeout, Duration::from_millis(2500));
        assert_eq!(options.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(options.max_concurrent_requests, 8);
        assert!(options.log_messages);
    }

    #[test]
    fn test_options_reject_bad_values() {
        let err = ConnectionOptions::from_lookup("aws", |k| {
            (k == "MCP_MAX_CONCURRENT_REQUESTS").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("at least 1"));

        let err = ConnectionOptions::from_lookup("aws", |k| {
            (k == "MCP_VALIDATE_CERTS").then(|| "maybe".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("MCP_VALIDATE_CERTS"));

        let manifest = Manifest::parse(MANIFEST).unwrap();
        let err = ConnectionOptions::new("iam")
            .with_max_concurrent_requests(0)
            .resolve_with(&manifest)
            .unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_interpolate_env_vars() {
        std::env::set_var("__MCP_TEST_TOKEN__", "s3cret");
        std::env::remove_var("__MCP_TEST_MISSING__");
        assert_eq!(interpolate_env_vars("Bearer ${__MCP_TEST_TOKEN__}"), "Bearer s3cret");
        assert_eq!(interpolate_env_vars("${__MCP_TEST_MISSING__:-/fallback}"), "/fallback");
        assert_eq!(interpolate_env_vars("${__MCP_TEST_MISSING__}"), "");
        assert_eq!(interpolate_env_vars("plain"), "plain");
        std::env::remove_var("__MCP_TEST_TOKEN__");
    }

    #[test]
    fn test_manifest_values_are_interpolated() {
        std::env::remove_var("__MCP_TEST_URL__");
        let manifest =
            Manifest::parse(r#"{"r": {"url": "${__MCP_TEST_URL__:-http://localhost:9/mcp}"}}"#)
                .unwrap();
        let ServerManifestEntry::Http(cfg) = manifest.server("r").unwrap() else {
            panic!("expected http");
        };
        assert_eq!(cfg.url, "http://localhost:9/mcp");
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/mcp"), format!("{}/mcp", home.display()));
        }
        assert_eq!(expand_tilde("/abs"), "/abs");
    }
}
