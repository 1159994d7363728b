//! Pinned tool identities.

use std::collections::BTreeMap;
use std::fmt;

use tracing::info;

use super::ToolError;
use crate::fsutil::safe_segment;

/// Where a tool comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallMethod {
    /// Fetch and compile a source module (`go install <module>@<version>`).
    Module { module: String },
    /// Download a release archive (or raw binary) and extract it.
    ///
    /// `url` may use `{{version}}`, `{{os}}`, `{{arch}}` and `{{uname_arch}}`.
    /// `path` is the binary's location inside the archive; when absent the
    /// archive is searched for a file named after the binary.
    Archive {
        url: String,
        path: Option<String>,
        sha256: Option<String>,
    },
}

impl InstallMethod {
    pub fn kind(&self) -> &'static str {
        match self {
            InstallMethod::Module { .. } => "module",
            InstallMethod::Archive { .. } => "archive",
        }
    }

    /// Module path or URL template.
    pub fn source(&self) -> &str {
        match self {
            InstallMethod::Module { module } => module,
            InstallMethod::Archive { url, .. } => url,
        }
    }
}

/// A pinned tool: one name, one version, one way to install it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: String,
    pub version: String,
    pub method: InstallMethod,
    /// Executable file name; defaults to the tool name (or, for modules, the
    /// last path element of the module).
    pub binary: Option<String>,
}

impl ToolSpec {
    pub fn module(name: impl Into<String>, version: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            method: InstallMethod::Module {
                module: module.into(),
            },
            binary: None,
        }
    }

    pub fn archive(name: impl Into<String>, version: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            method: InstallMethod::Archive {
                url: url.into(),
                path: None,
                sha256: None,
            },
            binary: None,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn binary_name(&self) -> String {
        if let Some(binary) = &self.binary {
            return binary.clone();
        }
        if let InstallMethod::Module { module } = &self.method {
            // `go install` names the binary after the last non-version element.
            let last = module
                .trim_end_matches('/')
                .rsplit('/')
                .find(|seg| !is_major_version(seg));
            if let Some(last) = last.filter(|s| !s.is_empty()) {
                return last.to_string();
            }
        }
        self.name.clone()
    }

    /// Reject values that cannot be used as cache path segments.
    pub fn validate(&self) -> Result<(), ToolError> {
        let invalid = |reason: String| ToolError::InvalidSpec {
            tool: self.name.clone(),
            reason,
        };
        if self.name.is_empty() || safe_segment(&self.name) != self.name || self.name.starts_with('.') {
            return Err(invalid("name must be a plain identifier".to_string()));
        }
        if self.version.is_empty()
            || safe_segment(&self.version) != self.version
            || self.version.starts_with('.')
        {
            return Err(invalid(format!("version '{}' is not a valid pin", self.version)));
        }
        let binary = self.binary_name();
        if binary.is_empty() || binary.contains('/') || binary.starts_with('.') {
            return Err(invalid(format!("binary name '{binary}' is not a file name")));
        }
        if let InstallMethod::Archive {
            sha256: Some(sha), ..
        } = &self.method
        {
            if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid("sha256 must be 64 hex characters".to_string()));
            }
        }
        if self.method.source().trim().is_empty() {
            return Err(invalid(format!("{} source is empty", self.method.kind())));
        }
        Ok(())
    }
}

impl fmt::Display for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

fn is_major_version(seg: &str) -> bool {
    seg.len() > 1 && seg.starts_with('v') && seg[1..].chars().all(|c| c.is_ascii_digit())
}

/// Environment key fragment for a tool name: `golangci-lint` -> `GOLANGCI_LINT`.
pub fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// All tools pinned for one invocation, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ToolSpec) -> Result<(), ToolError> {
        spec.validate()?;
        if self.tools.contains_key(&spec.name) {
            return Err(ToolError::Duplicate(spec.name));
        }
        self.tools.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Like [`ToolRegistry::get`] but unknown names are an error.
    pub fn resolve(&self, name: &str) -> Result<&ToolSpec, ToolError> {
        self.tools.get(name).ok_or_else(|| ToolError::UnknownTool {
            name: name.to_string(),
            required_by: None,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Re-pin tools for this invocation.
    ///
    /// Keys are tool names, or their [`env_key`] form as read from
    /// `BUILDWRIGHT_TOOL_<NAME>_VERSION`.
    pub fn apply_version_overrides(
        &mut self,
        overrides: &BTreeMap<String, String>,
    ) -> Result<(), ToolError> {
        for (key, version) in overrides {
            let spec = self
                .tools
                .values_mut()
                .find(|spec| spec.name == *key || env_key(&spec.name) == *key)
                .ok_or_else(|| ToolError::UnknownTool {
                    name: key.clone(),
                    required_by: None,
                })?;
            if spec.version != *version {
                info!(tool = %spec.name, from = %spec.version, to = %version, "tool version override");
                spec.version = version.clone();
            }
            spec.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn binary_name_defaults() {
        let plain = ToolSpec::archive("buf", "1.28.1", "https://example.com/buf.tar.gz");
        assert_eq!(plain.binary_name(), "buf");

        let module = ToolSpec::module(
            "lint",
            "v1.55.2",
            "github.com/golangci/golangci-lint/cmd/golangci-lint",
        );
        assert_eq!(module.binary_name(), "golangci-lint");

        let versioned = ToolSpec::module("gen", "v2.0.0", "example.com/codegen/v2");
        assert_eq!(versioned.binary_name(), "codegen");

        assert_eq!(plain.with_binary("buf-cli").binary_name(), "buf-cli");
    }

    #[test]
    fn rejects_unsafe_pins() {
        let bad_version = ToolSpec::module("gen", "../1.0", "example.com/gen");
        assert!(matches!(bad_version.validate(), Err(ToolError::InvalidSpec { .. })));

        let bad_name = ToolSpec::module("a/b", "1.0", "example.com/gen");
        assert!(bad_name.validate().is_err());

        let mut bad_sha = ToolSpec::archive("buf", "1.0", "https://example.com/buf");
        bad_sha.method = InstallMethod::Archive {
            url: "https://example.com/buf".into(),
            path: None,
            sha256: Some("abc".into()),
        };
        assert!(bad_sha.validate().is_err());
    }

    #[test]
    fn duplicate_and_unknown() {
        let mut reg = ToolRegistry::new();
        reg.register(ToolSpec::module("codegen", "1.0", "example.com/codegen"))
            .unwrap();
        assert_eq!(
            reg.register(ToolSpec::module("codegen", "2.0", "example.com/codegen")),
            Err(ToolError::Duplicate("codegen".into()))
        );
        let err = reg.resolve("protoc").unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool { .. }));
        assert_eq!(err.to_string(), "unknown tool 'protoc'");
        assert_eq!(reg.resolve("codegen").unwrap().version, "1.0");

        let from_task = ToolError::UnknownTool {
            name: "protoc".into(),
            required_by: Some("gen".into()),
        };
        assert_eq!(
            from_task.to_string(),
            "unknown tool 'protoc' (required by task 'gen')"
        );
    }

    #[test]
    fn version_overrides_accept_names_and_env_keys() {
        let mut reg = ToolRegistry::new();
        reg.register(ToolSpec::module(
            "golangci-lint",
            "v1.55.2",
            "github.com/golangci/golangci-lint/cmd/golangci-lint",
        ))
        .unwrap();
        reg.register(ToolSpec::module("codegen", "1.0", "example.com/codegen"))
            .unwrap();

        let overrides = BTreeMap::from([
            ("GOLANGCI_LINT".to_string(), "v1.56.0".to_string()),
            ("codegen".to_string(), "1.1".to_string()),
        ]);
        reg.apply_version_overrides(&overrides).unwrap();
        assert_eq!(reg.get("golangci-lint").unwrap().version, "v1.56.0");
        assert_eq!(reg.get("codegen").unwrap().version, "1.1");

        let unknown = BTreeMap::from([("protoc".to_string(), "25".to_string())]);
        assert!(reg.apply_version_overrides(&unknown).is_err());
    }

    #[test]
    fn env_keys() {
        assert_eq!(env_key("golangci-lint"), "GOLANGCI_LINT");
        assert_eq!(env_key("protoc-gen-go.v2"), "PROTOC_GEN_GO_V2");
    }
}
