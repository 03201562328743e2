//! Namespace resolution for import specifiers.
//!
//! There is no real filesystem: every specifier the compiler backend meets is
//! routed into one of three namespaces (`entry`, `internal`, `remote`) by an
//! ordered list of rules. The first rule that accepts a specifier wins.
//! Externalized specifiers are recognized before any of the URL rules so they
//! are never fetched.

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::registry::DependencyRegistry;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Entry,
    Internal,
    Remote,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Namespace::Entry => "entry",
            Namespace::Internal => "internal",
            Namespace::Remote => "remote",
        };
        f.write_str(name)
    }
}

/// A module address. `(namespace, id)` is the key; ids are only unique per namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedModule {
    pub id: String,
    pub namespace: Namespace,
    /// Externalized: resolved, but never loaded or traversed.
    pub external: bool,
}

impl ResolvedModule {
    pub fn new(namespace: Namespace, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            namespace,
            external: false,
        }
    }

    pub fn external(specifier: &str) -> Self {
        Self {
            id: specifier.to_string(),
            namespace: Namespace::Remote,
            external: true,
        }
    }
}

impl fmt::Display for ResolvedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

type Rule = fn(&NamespaceResolver, &str, Option<&ResolvedModule>) -> Result<Option<ResolvedModule>, SandboxError>;

/// Pure resolution logic; holds no per-build state.
pub struct NamespaceResolver {
    entry_specifier: String,
    internal_prefix: String,
    cdn_base: String,
    registry: Arc<DependencyRegistry>,
}

impl NamespaceResolver {
    pub fn new(config: &SandboxConfig, registry: Arc<DependencyRegistry>) -> Self {
        Self {
            entry_specifier: config.entry_specifier.clone(),
            internal_prefix: config.internal_prefix.clone(),
            cdn_base: config.cdn_base.trim_end_matches('/').to_string(),
            registry,
        }
    }

    /// Rule table in evaluation order. Externals outrank the URL rules but
    /// never the entry or internal rules.
    fn rules() -> [(&'static str, Rule); 7] {
        [
            ("entry", Self::entry_rule),
            ("internal-prefix", Self::internal_prefix_rule),
            ("external", Self::external_rule),
            ("absolute-url", Self::absolute_url_rule),
            ("remote-relative", Self::remote_relative_rule),
            ("internal-relative", Self::internal_relative_rule),
            ("cdn-fallback", Self::cdn_rule),
        ]
    }

    pub fn resolve(&self, specifier: &str, importer: Option<&ResolvedModule>) -> Result<ResolvedModule, SandboxError> {
        for (name, rule) in Self::rules() {
            if let Some(resolved) = rule(self, specifier, importer)? {
                tracing::trace!(specifier, rule = name, resolved = %resolved, "resolved import");
                return Ok(resolved);
            }
        }

        let from = importer.map(|m| m.to_string()).unwrap_or_else(|| "<root>".to_string());
        Err(SandboxError::resolution(
            specifier,
            format!("no resolution rule matches (imported from {})", from),
        ))
    }

    fn entry_rule(&self, specifier: &str, _importer: Option<&ResolvedModule>) -> Result<Option<ResolvedModule>, SandboxError> {
        if specifier == self.entry_specifier {
            return Ok(Some(ResolvedModule::new(Namespace::Entry, self.entry_specifier.clone())));
        }
        Ok(None)
    }

    fn internal_prefix_rule(&self, specifier: &str, _importer: Option<&ResolvedModule>) -> Result<Option<ResolvedModule>, SandboxError> {
        let Some(mut rest) = specifier.strip_prefix(self.internal_prefix.as_str()) else {
            return Ok(None);
        };
        // "@local/@local/x" and "@local//x" both collapse to "x"
        loop {
            let trimmed = rest.trim_start_matches('/');
            match trimmed.strip_prefix(self.internal_prefix.as_str()) {
                Some(next) => rest = next,
                None => {
                    rest = trimmed;
                    break;
                }
            }
        }

        let id = normalize_segments(rest.split('/'), self.prefix_segment());
        if id.is_empty() {
            return Err(SandboxError::resolution(specifier, "internal import names no asset"));
        }
        Ok(Some(ResolvedModule::new(Namespace::Internal, id)))
    }

    fn external_rule(&self, specifier: &str, _importer: Option<&ResolvedModule>) -> Result<Option<ResolvedModule>, SandboxError> {
        if self.registry.is_external(specifier) {
            return Ok(Some(ResolvedModule::external(specifier)));
        }
        Ok(None)
    }

    fn absolute_url_rule(&self, specifier: &str, _importer: Option<&ResolvedModule>) -> Result<Option<ResolvedModule>, SandboxError> {
        // Schemes are case-insensitive; the parsed URL carries the lowercase form.
        let web = specifier.split_once("://").is_some_and(|(scheme, _)| {
            scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
        });
        if !web {
            return Ok(None);
        }
        let url = Url::parse(specifier).map_err(|e| SandboxError::resolution(specifier, format!("invalid URL: {}", e)))?;
        Ok(Some(ResolvedModule::new(Namespace::Remote, url.as_str())))
    }

    fn remote_relative_rule(&self, specifier: &str, importer: Option<&ResolvedModule>) -> Result<Option<ResolvedModule>, SandboxError> {
        let Some(importer) = importer.filter(|m| m.namespace == Namespace::Remote) else {
            return Ok(None);
        };
        if !is_relative(specifier) {
            return Ok(None);
        }
        let base = Url::parse(&importer.id)
            .map_err(|e| SandboxError::resolution(specifier, format!("importer '{}' is not a URL: {}", importer.id, e)))?;
        let joined = base
            .join(specifier)
            .map_err(|e| SandboxError::resolution(specifier, format!("cannot join against '{}': {}", importer.id, e)))?;
        Ok(Some(ResolvedModule::new(Namespace::Remote, joined.to_string())))
    }

    fn internal_relative_rule(&self, specifier: &str, importer: Option<&ResolvedModule>) -> Result<Option<ResolvedModule>, SandboxError> {
        let Some(importer) = importer.filter(|m| m.namespace == Namespace::Internal) else {
            return Ok(None);
        };
        if !is_relative(specifier) {
            return Ok(None);
        }
        let segments: Vec<&str> = if specifier.starts_with('/') {
            specifier.split('/').collect()
        } else {
            let dir = importer.id.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
            dir.split('/').chain(specifier.split('/')).collect()
        };
        let id = normalize_segments(segments.into_iter(), self.prefix_segment());
        if id.is_empty() {
            return Err(SandboxError::resolution(specifier, "internal import names no asset"));
        }
        Ok(Some(ResolvedModule::new(Namespace::Internal, id)))
    }

    fn cdn_rule(&self, specifier: &str, _importer: Option<&ResolvedModule>) -> Result<Option<ResolvedModule>, SandboxError> {
        if !is_bare(specifier) {
            return Ok(None);
        }
        let url = format!("{}/{}", self.cdn_base, specifier);
        Url::parse(&url).map_err(|e| SandboxError::resolution(specifier, format!("invalid CDN URL '{}': {}", url, e)))?;
        Ok(Some(ResolvedModule::new(Namespace::Remote, url)))
    }

    fn prefix_segment(&self) -> &str {
        self.internal_prefix.trim_matches('/')
    }
}

fn is_relative(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/')
}

/// A bare package specifier: not relative, and not parseable as an absolute URL.
fn is_bare(specifier: &str) -> bool {
    !specifier.is_empty() && !is_relative(specifier) && !specifier.starts_with('.') && Url::parse(specifier).is_err()
}

/// Collapse `.`/`..`/empty segments; drop segments equal to the reserved prefix.
fn normalize_segments<'a>(segments: impl Iterator<Item = &'a str>, reserved: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for segment in segments {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s if s == reserved => {}
            s => out.push(s),
        }
    }
    out.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ExternalDependency;

    fn resolver_with(externals: Vec<ExternalDependency>) -> NamespaceResolver {
        let registry = Arc::new(DependencyRegistry::new(externals).unwrap());
        NamespaceResolver::new(&SandboxConfig::default(), registry)
    }

    fn resolver() -> NamespaceResolver {
        resolver_with(crate::registry::default_externals())
    }

    #[test]
    fn test_entry_specifier() {
        let resolved = resolver().resolve("index.js", None).unwrap();
        assert_eq!(resolved, ResolvedModule::new(Namespace::Entry, "index.js"));
    }

    #[test]
    fn test_internal_prefix_ignores_importer() {
        let resolver = resolver();
        let importers = [
            None,
            Some(ResolvedModule::new(Namespace::Entry, "index.js")),
            Some(ResolvedModule::new(Namespace::Remote, "https://unpkg.com/a/b.js")),
            Some(ResolvedModule::new(Namespace::Internal, "styles/base.css")),
        ];
        let specifiers = [
            "@local/theme.css",
            "@local//theme.css",
            "@local/@local/theme.css",
            "@local/a/@local/b.js",
            "@local/../../etc/passwd",
        ];

        for importer in &importers {
            for specifier in specifiers {
                let resolved = resolver.resolve(specifier, importer.as_ref()).unwrap();
                assert_eq!(resolved.namespace, Namespace::Internal, "{}", specifier);
                assert!(!resolved.id.contains("@local"), "{} -> {}", specifier, resolved.id);
                assert!(!resolved.id.starts_with('/'));
                assert!(!resolved.id.contains(".."));
            }
        }
    }

    #[test]
    fn test_absolute_url() {
        let resolved = resolver().resolve("https://cdn.example.com/lib.js", None).unwrap();
        assert_eq!(resolved, ResolvedModule::new(Namespace::Remote, "https://cdn.example.com/lib.js"));
    }

    #[test]
    fn test_absolute_url_scheme_is_case_insensitive() {
        let resolver = resolver();
        let upper = resolver.resolve("HTTPS://esm.sh/canvas-confetti", None).unwrap();
        assert_eq!(upper, ResolvedModule::new(Namespace::Remote, "https://esm.sh/canvas-confetti"));

        let mixed = resolver.resolve("Http://cdn.example.com/a.js", None).unwrap();
        assert_eq!(mixed.namespace, Namespace::Remote);
        assert_eq!(mixed.id, "http://cdn.example.com/a.js");
    }

    #[test]
    fn test_remote_relative_joins_against_importer() {
        let importer = ResolvedModule::new(Namespace::Remote, "https://cdn.example.com/pkg@1.0.0/dist/index.js");
        let resolver = resolver();

        let sibling = resolver.resolve("./util.js", Some(&importer)).unwrap();
        assert_eq!(sibling.id, "https://cdn.example.com/pkg@1.0.0/dist/util.js");

        let parent = resolver.resolve("../lib/core.js", Some(&importer)).unwrap();
        assert_eq!(parent.id, "https://cdn.example.com/pkg@1.0.0/lib/core.js");

        let rooted = resolver.resolve("/other@2/index.js", Some(&importer)).unwrap();
        assert_eq!(rooted.id, "https://cdn.example.com/other@2/index.js");
    }

    #[test]
    fn test_external_beats_cdn_and_url_rules() {
        let resolver = resolver_with(vec![
            ExternalDependency::library("React", "react"),
            ExternalDependency::library("Remote", "https://cdn.example.com/remote.js"),
        ]);
        let remote_importer = ResolvedModule::new(Namespace::Remote, "https://cdn.example.com/x.js");

        let react = resolver.resolve("react", Some(&remote_importer)).unwrap();
        assert!(react.external);
        assert_eq!(react.id, "react");

        let url = resolver.resolve("https://cdn.example.com/remote.js", None).unwrap();
        assert!(url.external);
    }

    #[test]
    fn test_external_does_not_beat_internal_or_entry() {
        let resolver = resolver_with(vec![
            ExternalDependency::library("Theme", "@local/theme.js"),
            ExternalDependency::library("Entry", "index.js"),
        ]);

        let internal = resolver.resolve("@local/theme.js", None).unwrap();
        assert_eq!(internal.namespace, Namespace::Internal);
        assert!(!internal.external);

        let entry = resolver.resolve("index.js", None).unwrap();
        assert_eq!(entry.namespace, Namespace::Entry);
    }

    #[test]
    fn test_bare_specifier_falls_back_to_cdn() {
        let resolved = resolver().resolve("left-pad", None).unwrap();
        assert_eq!(resolved, ResolvedModule::new(Namespace::Remote, "https://unpkg.com/left-pad"));

        let scoped = resolver().resolve("@scope/pkg/sub", None).unwrap();
        assert_eq!(scoped.id, "https://unpkg.com/@scope/pkg/sub");
    }

    #[test]
    fn test_relative_from_entry_is_unresolvable() {
        let entry = ResolvedModule::new(Namespace::Entry, "index.js");
        let err = resolver().resolve("./missing.js", Some(&entry)).unwrap_err();
        assert_eq!(err.kind(), "ResolutionError");
        assert!(err.to_string().contains("./missing.js"));
    }

    #[test]
    fn test_internal_relative_import() {
        let importer = ResolvedModule::new(Namespace::Internal, "widgets/button.js");
        let resolved = resolver().resolve("../styles/button.css", Some(&importer)).unwrap();
        assert_eq!(resolved, ResolvedModule::new(Namespace::Internal, "styles/button.css"));
    }

    #[test]
    fn test_other_schemes_are_unresolvable() {
        assert!(resolver().resolve("node:fs", None).is_err());
    }
}
