//! Registry of externalized dependencies.
//!
//! Each entry names a specifier the bundler must never inline, the binding the
//! program expects in scope, and the value the host passes for it. Entry order
//! is the positional-argument order of the injection calling convention:
//! `(container, entries[0].binding_name, entries[1].binding_name, ...)`.

use crate::error::SandboxError;
use serde::{Deserialize, Serialize};

/// Name of the first formal parameter of every finished program.
pub const CONTAINER_PARAM: &str = "container";

/// Value handed to the program for an external dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeValue {
    /// One of the libraries the host bootstrap provides (`react`, `react-dom/client`).
    Library(String),
    /// A JS expression evaluated in the host isolate.
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDependency {
    pub binding_name: String,
    pub specifier: String,
    pub runtime_value: RuntimeValue,
}

impl ExternalDependency {
    pub fn library(binding_name: &str, specifier: &str) -> Self {
        Self {
            binding_name: binding_name.to_string(),
            specifier: specifier.to_string(),
            runtime_value: RuntimeValue::Library(specifier.to_string()),
        }
    }
}

/// Default registry: the component library and its DOM renderer.
pub fn default_externals() -> Vec<ExternalDependency> {
    vec![
        ExternalDependency::library("React", "react"),
        ExternalDependency::library("ReactDOM", "react-dom/client"),
    ]
}

/// Validated, immutable registry. Shared behind an `Arc` once built.
#[derive(Debug, Clone, Default)]
pub struct DependencyRegistry {
    entries: Vec<ExternalDependency>,
}

impl DependencyRegistry {
    pub fn new(entries: Vec<ExternalDependency>) -> Result<Self, SandboxError> {
        for (index, entry) in entries.iter().enumerate() {
            if !is_binding_identifier(&entry.binding_name) {
                return Err(SandboxError::Config(format!(
                    "external binding name '{}' is not a valid identifier",
                    entry.binding_name
                )));
            }
            if entry.binding_name == CONTAINER_PARAM {
                return Err(SandboxError::Config(format!(
                    "external binding name '{}' collides with the container parameter",
                    CONTAINER_PARAM
                )));
            }
            if entry.specifier.trim().is_empty() {
                return Err(SandboxError::Config(format!(
                    "external '{}' has an empty specifier",
                    entry.binding_name
                )));
            }
            for earlier in &entries[..index] {
                if earlier.binding_name == entry.binding_name {
                    return Err(SandboxError::Config(format!(
                        "duplicate external binding name '{}'",
                        entry.binding_name
                    )));
                }
                if earlier.specifier == entry.specifier {
                    return Err(SandboxError::Config(format!(
                        "duplicate external specifier '{}'",
                        entry.specifier
                    )));
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ExternalDependency] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, specifier: &str) -> Option<&ExternalDependency> {
        self.entries.iter().find(|entry| entry.specifier == specifier)
    }

    pub fn is_external(&self, specifier: &str) -> bool {
        self.find(specifier).is_some()
    }

    pub fn specifiers(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.specifier.clone()).collect()
    }

    pub fn binding_names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.binding_name.clone()).collect()
    }

    pub fn runtime_values(&self) -> Vec<RuntimeValue> {
        self.entries.iter().map(|entry| entry.runtime_value.clone()).collect()
    }

    /// Formal parameter list of the finished program, container first.
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.entries.len() + 1);
        names.push(CONTAINER_PARAM.to_string());
        names.extend(self.binding_names());
        names
    }
}

/// Words that cannot name a binding in strict-mode module code.
const RESERVED_WORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete", "do", "else",
    "enum", "export", "extends", "false", "finally", "for", "function", "if", "implements", "import", "in",
    "instanceof", "interface", "let", "new", "null", "package", "private", "protected", "public", "return", "static",
    "super", "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
    "arguments", "eval",
];

/// ASCII JS identifier name check. Reserved words pass; property and export
/// names may be reserved words.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// An identifier that can be declared as a variable or parameter.
pub fn is_binding_identifier(name: &str) -> bool {
    is_identifier(name) && !RESERVED_WORDS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_order_follows_registry() {
        let registry = DependencyRegistry::new(vec![
            ExternalDependency::library("React", "react"),
            ExternalDependency::library("ReactDOM", "react-dom/client"),
            ExternalDependency::library("ReactIntl", "react-intl"),
        ])
        .unwrap();

        let params = registry.parameter_names();
        assert_eq!(params.len(), registry.len() + 1);
        assert_eq!(params, vec!["container", "React", "ReactDOM", "ReactIntl"]);
    }

    #[test]
    fn test_empty_registry_has_only_container() {
        let registry = DependencyRegistry::empty();
        assert_eq!(registry.parameter_names(), vec!["container"]);
        assert!(!registry.is_external("react"));
    }

    #[test]
    fn test_rejects_duplicate_bindings() {
        let result = DependencyRegistry::new(vec![
            ExternalDependency::library("React", "react"),
            ExternalDependency::library("React", "preact"),
        ]);
        assert!(result.unwrap_err().to_string().contains("duplicate external binding"));
    }

    #[test]
    fn test_rejects_container_binding() {
        let result = DependencyRegistry::new(vec![ExternalDependency::library("container", "x")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_non_identifier_binding() {
        let result = DependencyRegistry::new(vec![ExternalDependency::library("react-dom", "react-dom")]);
        assert!(result.unwrap_err().to_string().contains("not a valid identifier"));
    }

    #[test]
    fn test_rejects_reserved_word_binding() {
        for name in ["class", "default", "new", "await"] {
            let result = DependencyRegistry::new(vec![ExternalDependency::library(name, "some-lib")]);
            let message = result.unwrap_err().to_string();
            assert!(message.contains(&format!("'{}' is not a valid identifier", name)), "{}", message);
        }
        assert!(is_identifier("default"));
        assert!(is_binding_identifier("Default"));
    }

    #[test]
    fn test_runtime_value_serialization() {
        let value = serde_json::to_string(&RuntimeValue::Library("react".into())).unwrap();
        assert_eq!(value, r#"{"library":"react"}"#);
        let value = serde_json::to_string(&RuntimeValue::Expression("globalThis.x".into())).unwrap();
        assert_eq!(value, r#"{"expression":"globalThis.x"}"#);
    }
}
