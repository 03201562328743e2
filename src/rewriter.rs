//! Dependency injection rewrite.
//!
//! Turns a bundle into the body of the function the host invokes as
//! `(container, ...registry bindings)`: externalized import statements are
//! removed, locals that differ from the registry binding are re-declared from
//! it, and a trailing block locates the exported component and mounts it.

use crate::backend::{BundleOutput, ExternalImport};
use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::imports::{js_string, scan_imports, ImportClause};
use crate::registry::DependencyRegistry;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

/// An import statement taken out of the program.
#[derive(Debug, Clone)]
struct RemovedImport {
    specifier: String,
    clause: ImportClause,
}

pub struct InjectionRewriter {
    registry: Arc<DependencyRegistry>,
    global_name: String,
    mount_id: String,
}

impl InjectionRewriter {
    pub fn new(config: &SandboxConfig, registry: Arc<DependencyRegistry>) -> Self {
        Self {
            registry,
            global_name: config.global_name.clone(),
            mount_id: config.mount_id.clone(),
        }
    }

    /// Produce the finished program for `output`.
    pub fn rewrite(&self, output: &BundleOutput) -> Result<String, SandboxError> {
        let structural = output
            .external_imports
            .as_deref()
            .and_then(|imports| self.remove_structural(&output.program, imports));

        let (body, removed) = match structural {
            Some(result) => result,
            None => self.remove_textual(&output.program),
        };

        let program = format!("{}{}\n{}", self.declarations(&removed)?, body.trim_start(), self.mount_block());
        self.verify(&program)?;
        Ok(program)
    }

    /// Remove statements by their reported spans. `None` when the metadata
    /// does not line up with the text.
    fn remove_structural(&self, program: &str, imports: &[ExternalImport]) -> Option<(String, Vec<RemovedImport>)> {
        let mut ranges = Vec::new();
        let mut removed = Vec::new();

        for import in imports {
            if !self.registry.is_external(&import.specifier) {
                continue;
            }
            let statement = program.get(import.span.clone())?;
            if !statement.starts_with("import") || !statement.contains(import.specifier.as_str()) {
                tracing::debug!(specifier = %import.specifier, "import metadata does not match program text");
                return None;
            }
            ranges.push(import.span.clone());
            removed.push(RemovedImport {
                specifier: import.specifier.clone(),
                clause: import.clause.clone(),
            });
        }

        Some((cut(program, ranges)?, removed))
    }

    /// Scan the program for imports of registry specifiers.
    fn remove_textual(&self, program: &str) -> (String, Vec<RemovedImport>) {
        let mut ranges = Vec::new();
        let mut removed = Vec::new();

        for statement in scan_imports(program) {
            if !self.registry.is_external(statement.source) {
                continue;
            }
            let clause = match statement.clause {
                Some(text) => match ImportClause::parse(text) {
                    Ok(clause) => clause,
                    Err(e) => {
                        // Left in place; the integrity check reports it.
                        tracing::warn!(specifier = statement.source, "unparseable import clause: {}", e);
                        continue;
                    }
                },
                None => ImportClause::default(),
            };
            ranges.push(statement.range);
            removed.push(RemovedImport {
                specifier: statement.source.to_string(),
                clause,
            });
        }

        // Ranges come from one left-to-right scan, so they never overlap.
        let body = cut(program, ranges).unwrap_or_else(|| program.to_string());
        (body, removed)
    }

    /// `const` declarations for imported locals that differ from the binding.
    ///
    /// A local imported twice must refer to the same value both times; the
    /// declarations share one scope.
    fn declarations(&self, removed: &[RemovedImport]) -> Result<String, SandboxError> {
        let parameters: HashSet<String> = self.registry.parameter_names().into_iter().collect();
        let mut declared: HashMap<String, String> = HashMap::new();
        let mut out = String::new();

        for import in removed {
            let Some(entry) = self.registry.find(&import.specifier) else {
                continue;
            };
            let binding = entry.binding_name.as_str();
            let mut accept = |local: &str, target: String| -> Result<bool, SandboxError> {
                if local == binding {
                    return Ok(false);
                }
                if parameters.contains(local) {
                    tracing::warn!(local, specifier = %import.specifier, "import shadows an injected parameter; using the parameter");
                    return Ok(false);
                }
                match declared.get(local) {
                    None => {
                        declared.insert(local.to_string(), target);
                        Ok(true)
                    }
                    Some(existing) if *existing == target => Ok(false),
                    Some(existing) => Err(SandboxError::Compile(format!(
                        "import binding `{}` refers to both `{}` and `{}`",
                        local, existing, target
                    ))),
                }
            };

            let mut whole: Vec<&str> = Vec::new();
            whole.extend(import.clause.default.as_deref());
            whole.extend(import.clause.namespace.as_deref());
            let mut fields: Vec<String> = Vec::new();
            for named in &import.clause.named {
                if named.imported == "default" {
                    whole.push(&named.local);
                } else if accept(&named.local, format!("{}.{}", binding, named.imported))? {
                    if named.imported == named.local {
                        fields.push(named.local.clone());
                    } else {
                        fields.push(format!("{}: {}", named.imported, named.local));
                    }
                }
            }

            for local in whole {
                if accept(local, binding.to_string())? {
                    out.push_str(&format!("const {} = {};\n", local, binding));
                }
            }
            if !fields.is_empty() {
                out.push_str(&format!("const {{ {} }} = {};\n", fields.join(", "), binding));
            }
        }
        Ok(out)
    }

    /// Locates the exported component and mounts it; evaluates to the mount outcome.
    fn mount_block(&self) -> String {
        let global = &self.global_name;
        let selector = js_string(&format!("#{}", self.mount_id));
        format!(
            r#"return (function (exported) {{
  var candidate = exported && (exported.default || exported.App) || exported;
  if (typeof candidate !== "function") {{
    var detail = "No component found: export a default component or one named App";
    console.warn(detail);
    return {{ kind: "NotFound", detail: detail }};
  }}
  var target = container.querySelector({selector});
  if (!target) throw new Error("Mount target " + {selector} + " is missing from the container");
  container.createMountRoot(target).render(candidate);
  return {{ kind: "Found", component: candidate.displayName || candidate.name || "anonymous" }};
}})(typeof {global} === "undefined" ? undefined : {global});
"#
        )
    }

    /// No import of an externalized specifier may survive the rewrite.
    fn verify(&self, program: &str) -> Result<(), SandboxError> {
        match scan_imports(program).find(|statement| self.registry.is_external(statement.source)) {
            Some(statement) => Err(SandboxError::RewriteIntegrity {
                specifier: statement.source.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Remove `ranges` from `text`; `None` if any range is out of bounds or overlaps.
fn cut(text: &str, mut ranges: Vec<Range<usize>>) -> Option<String> {
    ranges.sort_by_key(|range| std::cmp::Reverse(range.start));
    let mut out = text.to_string();
    let mut limit = text.len();
    for range in ranges {
        if range.end > limit || !text.is_char_boundary(range.start) || !text.is_char_boundary(range.end) {
            return None;
        }
        out.replace_range(range.clone(), "");
        limit = range.start;
    }
    Some(out)
}
