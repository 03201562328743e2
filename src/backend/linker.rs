//! Reference backend: links a module graph into one self-invoking closure.
//!
//! Every module becomes a function in a definition table inside the closure;
//! static imports and exports are rewritten into table lookups. CommonJS
//! modules (as served by most package CDNs) get `module`/`exports` and a
//! default-export interop. Externalized imports are hoisted as literal
//! `import` statements above the closure and reported as metadata, which is
//! the shape the injection rewriter expects from any backend.
//!
//! Scanning is text-level, so imports inside strings or comments are seen as
//! real ones. JSX and TypeScript are not transpiled.

use super::{BackendConfig, BuildRequest, BundleOutput, CompilerBackend, ExternalImport, ModuleHooks};
use crate::error::SandboxError;
use crate::imports::{js_string, scan_imports, ImportClause, NamedImport};
use crate::loader::ContentKind;
use crate::resolver::{Namespace, ResolvedModule};
use async_trait::async_trait;
use regex::{Captures, NoExpand, Regex};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::LazyLock;

static EXPORT_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"\bexport\s*(?:\*(?:\s*as\s+(?P<alias>[A-Za-z_$][\w$]*))?|\{(?P<list>[^}]*)\})\s*from\s*["'](?P<source>[^"'\r\n]+)["'][ \t]*;?"#,
    )
    .expect("valid regex")
});

static ESM_EXPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bexport\b\s*(?:default\b|\{|\*|function\b|class\b|const\b|let\b|var\b|async\b)").expect("valid regex")
});

static EXPORT_DEFAULT_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bexport\s+default\s+(?P<kw>(?:async\s+)?function\b\s*\*?|class\b)\s*(?P<name>[A-Za-z_$][\w$]*)?")
        .expect("valid regex")
});

static EXPORT_DEFAULT_EXPR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bexport\s+default\b\s*").expect("valid regex"));

static EXPORT_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bexport\s+(?P<decl>(?:async\s+)?function\b\s*\*?|class\b|const\b|let\b|var\b)\s*(?P<name>[A-Za-z_$][\w$]*)")
        .expect("valid regex")
});

static EXPORT_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bexport\s*\{(?P<list>[^}]*)\}[ \t]*;?").expect("valid regex"));

static REQUIRE_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\brequire\s*\(\s*["'](?P<source>[^"'\r\n]+)["']\s*\)"#).expect("valid regex")
});

static COMMONJS_EXPORTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bmodule\.exports\b|\bexports\.[A-Za-z_$][\w$]*\s*=|\bexports\[").expect("valid regex"));

/// Helpers shared by every module inside the bundle closure.
const RUNTIME: &str = r#"  var __records = [];
  function __interop(value) {
    if (value && value.__esModule) return value;
    var namespace = { default: value };
    if (value !== null && (typeof value === "object" || typeof value === "function")) {
      Object.keys(value).forEach(function (key) {
        if (key !== "default") namespace[key] = value[key];
      });
    }
    return namespace;
  }
  function __load(index) {
    var record = __records[index];
    if (record) return record;
    var module = { exports: {} };
    record = __records[index] = { module: module, namespace: module.exports };
    __definitions[index].call(module.exports, module.exports, module);
    if (__commonjs[index]) record.namespace = __interop(module.exports);
    return record;
  }
  function __require(index) {
    return __load(index).namespace;
  }
  function __requireRaw(index) {
    return __load(index).module.exports;
  }
  function __exportStar(target, source) {
    Object.keys(source).forEach(function (key) {
      if (key !== "default" && !(key in target)) target[key] = source[key];
    });
  }
  function __injectStyle(css, id) {
    if (typeof container === "undefined" || !container || !container.ownerDocument) return;
    var style = container.ownerDocument.createElement("style");
    style.setAttribute("data-module", id);
    style.textContent = css;
    container.appendChild(style);
  }
"#;

#[derive(Debug, Default)]
pub struct ModuleLinker {
    config: Option<BackendConfig>,
}

impl ModuleLinker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CompilerBackend for ModuleLinker {
    async fn initialize(&mut self, config: &BackendConfig) -> Result<(), SandboxError> {
        self.config = Some(config.clone());
        Ok(())
    }

    async fn build(&self, request: &BuildRequest, hooks: &dyn ModuleHooks) -> Result<BundleOutput, SandboxError> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| SandboxError::Compile("module linker used before initialize()".into()))?;
        let defines = compile_defines(config)?;

        let entry = hooks.resolve(&request.entry, None)?;
        if entry.external {
            return Err(SandboxError::Compile(format!(
                "entry \"{}\" cannot be an external module",
                request.entry
            )));
        }

        let mut graph = Graph::new(entry, &request.externals);
        let mut bodies: Vec<LinkedBody> = Vec::new();

        // Modules are appended as they are discovered; link until the table stops growing.
        while bodies.len() < graph.modules.len() {
            let module = graph.modules[bodies.len()].clone();
            let content = hooks.load(&module).await?;

            let body = match content.kind {
                ContentKind::Stylesheet => LinkedBody {
                    code: format!("__injectStyle({}, {});", js_string(&content.text), js_string(&module.to_string())),
                    commonjs: false,
                },
                ContentKind::Script => {
                    // Relative imports of a redirected module join against where it was served from.
                    let base = match content.location {
                        Some(location) => ResolvedModule {
                            id: location,
                            ..module.clone()
                        },
                        None => module.clone(),
                    };
                    let source = apply_defines(&content.text, &defines);
                    link_script(bodies.len(), &module, &base, &source, &mut graph, hooks)?
                }
            };
            tracing::trace!(module = %module, commonjs = body.commonjs, "linked module");
            bodies.push(body);
        }

        Ok(emit(request, &graph, &bodies))
    }
}

struct LinkedBody {
    code: String,
    commonjs: bool,
}

enum Target {
    External(String),
    Module(usize),
}

struct Graph<'r> {
    modules: Vec<ResolvedModule>,
    index: HashMap<ResolvedModule, usize>,
    externals: &'r [String],
    hoisted: Vec<(String, ImportClause)>,
    /// Top-level locals of the hoisted imports and the `specifier.export` each one holds.
    bound: HashMap<String, String>,
}

impl<'r> Graph<'r> {
    fn new(entry: ResolvedModule, externals: &'r [String]) -> Self {
        let mut graph = Self {
            modules: Vec::new(),
            index: HashMap::new(),
            externals,
            hoisted: Vec::new(),
            bound: HashMap::new(),
        };
        graph.intern(entry);
        graph
    }

    fn intern(&mut self, module: ResolvedModule) -> usize {
        if let Some(index) = self.index.get(&module) {
            return *index;
        }
        let index = self.modules.len();
        self.index.insert(module.clone(), index);
        self.modules.push(module);
        index
    }

    fn target(&mut self, specifier: &str, importer: &ResolvedModule, hooks: &dyn ModuleHooks) -> Result<Target, SandboxError> {
        let resolved = hooks.resolve(specifier, Some(importer))?;
        let listed = resolved.namespace == Namespace::Remote && self.externals.iter().any(|e| e == specifier);
        if resolved.external || listed {
            return Ok(Target::External(specifier.to_string()));
        }
        Ok(Target::Module(self.intern(resolved)))
    }

    /// Hoist an external import from module `slot`.
    ///
    /// Hoisted locals share the top-level scope, so a local already holding a
    /// different export is hoisted under a per-module alias instead; the
    /// returned code re-declares the original name inside the module.
    fn hoist(&mut self, slot: usize, specifier: &str, clause: ImportClause) -> String {
        let mut aliases = String::new();
        let mut bind = |local: &str, export: &str| -> String {
            let target = format!("{}.{}", specifier, export);
            match self.bound.get(local) {
                Some(existing) if *existing != target => {
                    let alias = format!("__x{}_{}", slot, local);
                    aliases.push_str(&format!("var {} = {};", local, alias));
                    self.bound.insert(alias.clone(), target);
                    alias
                }
                _ => {
                    self.bound.insert(local.to_string(), target);
                    local.to_string()
                }
            }
        };

        let hoisted = ImportClause {
            default: clause.default.as_deref().map(|local| bind(local, "*")),
            namespace: clause.namespace.as_deref().map(|local| bind(local, "*")),
            named: clause
                .named
                .iter()
                .map(|named| {
                    let export = if named.imported == "default" { "*" } else { named.imported.as_str() };
                    NamedImport {
                        imported: named.imported.clone(),
                        local: bind(&named.local, export),
                    }
                })
                .collect(),
        };

        let exists = self.hoisted.iter().any(|(s, c)| s == specifier && *c == hoisted);
        if !exists {
            self.hoisted.push((specifier.to_string(), hoisted));
        }
        aliases
    }
}

fn link_script(
    slot: usize,
    module: &ResolvedModule,
    base: &ResolvedModule,
    source: &str,
    graph: &mut Graph<'_>,
    hooks: &dyn ModuleHooks,
) -> Result<LinkedBody, SandboxError> {
    let mut edits: Vec<(Range<usize>, String)> = Vec::new();
    let esm = ESM_EXPORT.is_match(source) || scan_imports(source).next().is_some();

    for statement in scan_imports(source) {
        let clause = match statement.clause {
            Some(text) => ImportClause::parse(text).map_err(|e| compile_error(module, &e))?,
            None => ImportClause::default(),
        };
        let replacement = match graph.target(statement.source, base, hooks)? {
            Target::External(specifier) => graph.hoist(slot, &specifier, clause),
            Target::Module(index) => import_bindings(index, &clause),
        };
        edits.push((statement.range, replacement));
    }

    for caps in EXPORT_FROM.captures_iter(source) {
        let Some(whole) = caps.get(0) else { continue };
        let index = match graph.target(&caps["source"], base, hooks)? {
            Target::External(specifier) => {
                return Err(compile_error(
                    module,
                    &format!("re-exporting externalized module \"{}\" is not supported", specifier),
                ));
            }
            Target::Module(index) => index,
        };
        let replacement = if let Some(list) = caps.name("list") {
            let assignments: Vec<String> = parse_export_list(list.as_str())
                .map_err(|e| compile_error(module, &e))?
                .into_iter()
                .map(|(exported, local)| format!("__exports.{} = __reexport.{};", exported, local))
                .collect();
            format!("{{ var __reexport = __require({}); {} }}", index, assignments.join(" "))
        } else if let Some(alias) = caps.name("alias") {
            format!("__exports.{} = __require({});", alias.as_str(), index)
        } else {
            format!("__exportStar(__exports, __require({}));", index)
        };
        edits.push((whole.range(), replacement));
    }

    let mut commonjs = false;
    if !esm {
        for caps in REQUIRE_CALL.captures_iter(source) {
            let Some(whole) = caps.get(0) else { continue };
            let replacement = match graph.target(&caps["source"], base, hooks)? {
                Target::External(specifier) => {
                    let local = external_local(&specifier);
                    let clause = ImportClause {
                        namespace: Some(local.clone()),
                        ..Default::default()
                    };
                    graph.hoist(slot, &specifier, clause);
                    local
                }
                Target::Module(index) => format!("__requireRaw({})", index),
            };
            edits.push((whole.range(), replacement));
            commonjs = true;
        }
        commonjs = commonjs || COMMONJS_EXPORTS.is_match(source);
    }

    let linked = apply_edits(source, edits);

    if esm {
        let (code, exports) = rewrite_exports(&linked).map_err(|e| compile_error(module, &e))?;
        let assignments: String = exports
            .iter()
            .map(|(exported, local)| format!("__exports.{} = {};\n", exported, local))
            .collect();
        return Ok(LinkedBody {
            code: format!("\"use strict\";\n{}\n{}", code, assignments),
            commonjs: false,
        });
    }

    let code = if commonjs {
        format!("var exports = module.exports;\n{}", linked)
    } else {
        linked
    };
    Ok(LinkedBody { code, commonjs })
}

/// Turns export declarations into plain declarations plus `__exports` assignments.
fn rewrite_exports(text: &str) -> Result<(String, Vec<(String, String)>), String> {
    let mut exports: Vec<(String, String)> = Vec::new();
    let mut errors: Vec<String> = Vec::new();

    let text = EXPORT_DEFAULT_DECL
        .replace_all(text, |caps: &Captures| {
            let keyword = caps["kw"].trim_end().to_string();
            match caps.name("name").map(|m| m.as_str()) {
                Some("extends") => format!("__exports.default = {} extends", keyword),
                Some(name) => {
                    exports.push(("default".to_string(), name.to_string()));
                    format!("{} {}", keyword, name)
                }
                None => format!("__exports.default = {} ", keyword),
            }
        })
        .into_owned();

    let text = EXPORT_DEFAULT_EXPR.replace_all(&text, "__exports.default = ").into_owned();

    let source = text.as_str();
    let text = EXPORT_DECL
        .replace_all(source, |caps: &Captures| {
            let keyword = caps["decl"].trim_end();
            let name = caps["name"].to_string();
            let declaration = format!("{} {}", keyword, name);
            exports.push((name.clone(), name));
            if matches!(keyword, "const" | "let" | "var") {
                let rest = caps.get(0).map_or("", |m| &source[m.end()..]);
                match trailing_declarators(rest) {
                    Ok(names) => exports.extend(names.into_iter().map(|name| (name.clone(), name))),
                    Err(e) => errors.push(e),
                }
            }
            declaration
        })
        .into_owned();

    let text = EXPORT_LIST
        .replace_all(&text, |caps: &Captures| {
            match parse_export_list(&caps["list"]) {
                Ok(pairs) => exports.extend(pairs),
                Err(e) => errors.push(e),
            }
            String::new()
        })
        .into_owned();

    if let Some(error) = errors.into_iter().next() {
        return Err(error);
    }
    if let Some(leftover) = ESM_EXPORT.find(&text) {
        let snippet: String = text[leftover.start()..].lines().next().unwrap_or("").chars().take(60).collect();
        return Err(format!("unsupported export syntax `{}`", snippet.trim()));
    }

    Ok((text, exports))
}

/// Names of the declarators after the first in `= 1, b = f(x, y), c;`:
/// identifiers following a comma at nesting depth zero, up to the end of the
/// statement.
fn trailing_declarators(rest: &str) -> Result<Vec<String>, String> {
    let mut names = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut last = ' ';
    let mut chars = rest.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            if c == '\\' {
                chars.next();
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => quote = Some(c),
            '/' if rest[i + 1..].starts_with('/') => {
                while chars.next_if(|(_, c)| *c != '\n').is_some() {}
                continue;
            }
            '/' if rest[i + 1..].starts_with('*') => {
                let end = rest[i + 2..].find("*/").map_or(rest.len(), |at| i + 2 + at + 2);
                while chars.next_if(|(at, _)| *at < end).is_some() {}
                continue;
            }
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' if depth == 0 => break,
            ')' | ']' | '}' => depth -= 1,
            ';' if depth == 0 => break,
            '\n' if depth == 0 => {
                let continues = matches!(last, ',' | '=' | '+' | '-' | '*' | '/' | '&' | '|' | '?' | ':' | '<' | '>' | '(')
                    || rest[i..].trim_start().starts_with([',', '.', '?', ':', '+', '-', '*', '/', '&', '|']);
                if !continues {
                    break;
                }
            }
            ',' if depth == 0 => {
                let after = rest[i + 1..].trim_start();
                let name: String = after
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '$')
                    .collect();
                if !crate::registry::is_binding_identifier(&name) {
                    let snippet: String = after.chars().take(30).collect();
                    return Err(format!("unsupported export declarator `{}`", snippet.trim()));
                }
                names.push(name);
            }
            _ => {}
        }
        if !c.is_whitespace() {
            last = c;
        }
    }
    Ok(names)
}

/// `a, b as c` -> `[(a, a), (c, b)]` as `(exported, local)` pairs.
fn parse_export_list(list: &str) -> Result<Vec<(String, String)>, String> {
    let mut pairs = Vec::new();
    for item in list.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let words: Vec<&str> = item.split_whitespace().collect();
        match words.as_slice() {
            [name] => pairs.push((name.to_string(), name.to_string())),
            [local, "as", exported] => pairs.push((exported.to_string(), local.to_string())),
            _ => return Err(format!("malformed export list entry `{}`", item)),
        }
    }
    Ok(pairs)
}

fn import_bindings(index: usize, clause: &ImportClause) -> String {
    if clause.is_empty() {
        return format!("__require({});", index);
    }
    let mut out = format!("var __m{0} = __require({0});", index);
    if let Some(default) = &clause.default {
        out.push_str(&format!(" var {} = __m{}.default;", default, index));
    }
    if let Some(namespace) = &clause.namespace {
        out.push_str(&format!(" var {} = __m{};", namespace, index));
    }
    for named in &clause.named {
        out.push_str(&format!(" var {} = __m{}.{};", named.local, index, named.imported));
    }
    out
}

/// Local name used for a CommonJS `require` of an externalized module.
fn external_local(specifier: &str) -> String {
    let sanitized: String = specifier
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("__ext_{}", sanitized)
}

fn apply_edits(source: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    edits.sort_by_key(|(range, _)| range.start);
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    for (range, replacement) in edits {
        if range.start < cursor {
            continue;
        }
        out.push_str(&source[cursor..range.start]);
        out.push_str(&replacement);
        cursor = range.end;
    }
    out.push_str(&source[cursor..]);
    out
}

fn compile_defines(config: &BackendConfig) -> Result<Vec<(Regex, String)>, SandboxError> {
    config
        .define
        .iter()
        .map(|(key, value)| {
            let starts_word = key.chars().next().is_some_and(|c| c.is_alphanumeric() || c == '_');
            let ends_word = key.chars().last().is_some_and(|c| c.is_alphanumeric() || c == '_');
            let pattern = format!(
                "{}{}{}",
                if starts_word { r"\b" } else { "" },
                regex::escape(key),
                if ends_word { r"\b" } else { "" }
            );
            Regex::new(&pattern)
                .map(|re| (re, value.clone()))
                .map_err(|e| SandboxError::Compile(format!("invalid define key '{}': {}", key, e)))
        })
        .collect()
}

fn apply_defines(text: &str, defines: &[(Regex, String)]) -> String {
    let mut out = text.to_string();
    for (pattern, value) in defines {
        out = pattern.replace_all(&out, NoExpand(value)).into_owned();
    }
    out
}

fn compile_error(module: &ResolvedModule, message: &str) -> SandboxError {
    SandboxError::Compile(format!("{}: {}", module, message))
}

fn emit(request: &BuildRequest, graph: &Graph<'_>, bodies: &[LinkedBody]) -> BundleOutput {
    let mut program = String::new();
    let mut external_imports = Vec::with_capacity(graph.hoisted.len());

    for (specifier, clause) in &graph.hoisted {
        let start = program.len();
        program.push_str(&clause.to_statement(specifier));
        external_imports.push(ExternalImport {
            specifier: specifier.clone(),
            clause: clause.clone(),
            span: start..program.len(),
        });
        program.push('\n');
    }

    program.push_str(&format!("var {} = (function () {{\n", request.global_name));
    program.push_str(RUNTIME);
    let flags: Vec<&str> = bodies
        .iter()
        .map(|body| if body.commonjs { "true" } else { "false" })
        .collect();
    program.push_str(&format!("  var __commonjs = [{}];\n", flags.join(", ")));
    program.push_str("  var __definitions = [\n");
    for (module, body) in graph.modules.iter().zip(bodies) {
        program.push_str(&format!(
            "    // {}\n    function (__exports, module) {{\n{}\n    }},\n",
            module, body.code
        ));
    }
    program.push_str("  ];\n  return __require(0);\n})();\n");

    BundleOutput {
        program,
        external_imports: Some(external_imports),
    }
}
