//! Static `import` statement grammar shared by the linker and the rewriter.
//!
//! This is a text-level scanner, not a parser: it recognizes the statement
//! forms bundlers emit (`import D from "x"`, `import * as N from "x"`,
//! `import { a, b as c } from "x"`, combinations, and `import "x"`).
//! Dynamic `import()` calls are never matched.

use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

pub static IMPORT_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bimport\b\s*(?:(?P<clause>[\w$*{}\s,]+?)\s*\bfrom\s*)?["'](?P<source>[^"'\r\n]+)["'][ \t]*;?"#)
        .expect("valid regex")
});

/// One static import statement found in a text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportStatement<'t> {
    pub range: Range<usize>,
    pub source: &'t str,
    pub clause: Option<&'t str>,
}

pub fn scan_imports(text: &str) -> impl Iterator<Item = ImportStatement<'_>> {
    IMPORT_STATEMENT.captures_iter(text).filter_map(|caps| {
        let whole = caps.get(0)?;
        let source = caps.name("source")?.as_str();
        Some(ImportStatement {
            range: whole.range(),
            source,
            clause: caps.name("clause").map(|m| m.as_str()),
        })
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedImport {
    pub imported: String,
    pub local: String,
}

/// Bindings introduced by an import statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportClause {
    pub default: Option<String>,
    pub namespace: Option<String>,
    pub named: Vec<NamedImport>,
}

impl ImportClause {
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty import clause".to_string());
        }

        let (head, list) = match text.find('{') {
            Some(open) => {
                let close = text
                    .rfind('}')
                    .filter(|close| *close > open)
                    .ok_or_else(|| format!("unterminated import list in `{}`", text))?;
                if !text[close + 1..].trim().is_empty() {
                    return Err(format!("unexpected text after import list in `{}`", text));
                }
                (&text[..open], Some(&text[open + 1..close]))
            }
            None => (text, None),
        };

        let mut clause = ImportClause::default();
        for part in head.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            if let Some(rest) = part.strip_prefix('*') {
                let words: Vec<&str> = rest.split_whitespace().collect();
                match words.as_slice() {
                    ["as", name] if is_binding(name) && clause.namespace.is_none() => {
                        clause.namespace = Some(name.to_string());
                    }
                    _ => return Err(format!("malformed namespace import `{}`", part)),
                }
            } else if is_binding(part) && clause.default.is_none() {
                clause.default = Some(part.to_string());
            } else {
                return Err(format!("malformed default import `{}`", part));
            }
        }

        if let Some(list) = list {
            for item in list.split(',').map(str::trim).filter(|item| !item.is_empty()) {
                let words: Vec<&str> = item.split_whitespace().collect();
                let (imported, local) = match words.as_slice() {
                    [name] => (*name, *name),
                    [imported, "as", local] => (*imported, *local),
                    _ => return Err(format!("malformed named import `{}`", item)),
                };
                if !crate::registry::is_identifier(imported) || !is_binding(local) {
                    return Err(format!("malformed named import `{}`", item));
                }
                clause.named.push(NamedImport {
                    imported: imported.to_string(),
                    local: local.to_string(),
                });
            }
        }

        Ok(clause)
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.namespace.is_none() && self.named.is_empty()
    }

    /// Local names this clause declares, in source order.
    pub fn locals(&self) -> Vec<&str> {
        let mut locals = Vec::new();
        locals.extend(self.default.as_deref());
        locals.extend(self.namespace.as_deref());
        locals.extend(self.named.iter().map(|n| n.local.as_str()));
        locals
    }

    /// Canonical statement text for this clause.
    pub fn to_statement(&self, specifier: &str) -> String {
        let mut parts = Vec::new();
        if let Some(default) = &self.default {
            parts.push(default.clone());
        }
        if let Some(namespace) = &self.namespace {
            parts.push(format!("* as {}", namespace));
        }
        if !self.named.is_empty() {
            let names: Vec<String> = self
                .named
                .iter()
                .map(|n| {
                    if n.imported == n.local {
                        n.local.clone()
                    } else {
                        format!("{} as {}", n.imported, n.local)
                    }
                })
                .collect();
            parts.push(format!("{{ {} }}", names.join(", ")));
        }

        if parts.is_empty() {
            format!("import {};", js_string(specifier))
        } else {
            format!("import {} from {};", parts.join(", "), js_string(specifier))
        }
    }
}

fn is_binding(name: &str) -> bool {
    crate::registry::is_binding_identifier(name)
}

/// Double-quoted JS string literal.
pub fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
