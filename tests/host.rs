use preview_sandbox::{
    BuildResult, BundleOrchestrator, CompilerBackend, DependencyRegistry, ExecutionHost, ExternalDependency,
    HostState, InjectionRewriter, ModuleLinker, MountOutcome, RuntimeValue, SandboxConfig,
};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

fn default_registry() -> Arc<DependencyRegistry> {
    Arc::new(DependencyRegistry::new(preview_sandbox::default_externals()).unwrap())
}

/// Bundle and rewrite `source` the way the pipeline worker does.
async fn finish(config: &SandboxConfig, registry: &Arc<DependencyRegistry>, source: &str) -> String {
    let orchestrator = BundleOrchestrator::new(config, registry.clone()).unwrap();
    let mut linker = ModuleLinker::new();
    linker.initialize(&orchestrator.backend_config()).await.unwrap();
    match orchestrator.bundle(&linker, source).await {
        BuildResult::Success(output) => InjectionRewriter::new(config, registry.clone()).rewrite(&output).unwrap(),
        BuildResult::Failure { message } => panic!("build failed: {}", message),
    }
}

#[tokio::test]
async fn test_component_with_hooks_renders() {
    let config = SandboxConfig::default();
    let registry = default_registry();
    let source = r#"
import React, { useState, useEffect } from "react";

export default function App() {
  const [count, setCount] = useState(1);
  useEffect(() => {
    setCount(2);
  }, []);
  return React.createElement("p", { className: "count" }, "Count: ", count);
}
"#;
    let program = finish(&config, &registry, source).await;
    let mut host = ExecutionHost::new(&config, registry).unwrap();

    let outcome = host.run(&program).await.unwrap();
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.mounted_component(), Some("App"));
    assert_eq!(host.state(), HostState::Ready);
    assert_eq!(
        host.container_html().unwrap(),
        r#"<div id="root"><p class="count">Count: 2</p></div>"#
    );
}

#[tokio::test]
async fn test_app_without_export_is_found() {
    let config = SandboxConfig::default();
    let registry = default_registry();
    let program = finish(&config, &registry, "function App() { return 'hello'; }").await;
    let mut host = ExecutionHost::new(&config, registry).unwrap();

    let outcome = host.run(&program).await.unwrap();
    assert_eq!(outcome.mounted_component(), Some("App"));
    assert_eq!(host.container_html().unwrap(), r#"<div id="root">hello</div>"#);
}

#[tokio::test]
async fn test_no_component_is_a_soft_warning() {
    let config = SandboxConfig::default();
    let registry = default_registry();
    let program = finish(&config, &registry, "export const answer = 42;").await;
    let mut host = ExecutionHost::new(&config, registry).unwrap();

    let outcome = host.run(&program).await.unwrap();
    assert!(outcome.no_component_found());
    assert_eq!(outcome.error, None);
    assert_eq!(host.state(), HostState::Ready);

    let console = host.take_console();
    assert_eq!(console.warns.len(), 1);
    assert!(console.warns[0].starts_with("No component found"));
}

#[tokio::test]
async fn test_execution_error_is_recoverable() {
    let config = SandboxConfig::default();
    let registry = default_registry();
    let failing = finish(
        &config,
        &registry,
        "export default function App() { throw new RangeError('kaboom'); }",
    )
    .await;
    let working = finish(&config, &registry, "export default function App() { return 'ok'; }").await;
    let mut host = ExecutionHost::new(&config, registry).unwrap();

    let outcome = host.run(&failing).await.unwrap();
    let error = outcome.error.unwrap();
    assert_eq!(error.name, "RangeError");
    assert_eq!(error.message, "kaboom");
    assert!(error.stack.is_some());
    assert_eq!(host.state(), HostState::Error);

    host.begin_loading().unwrap();
    let outcome = host.run(&working).await.unwrap();
    assert_eq!(outcome.error, None);
    assert_eq!(host.state(), HostState::Ready);
    assert_eq!(host.container_html().unwrap(), r#"<div id="root">ok</div>"#);
}

#[tokio::test]
async fn test_positional_arguments_follow_registry_order() {
    let config = SandboxConfig::default();
    let mut externals = preview_sandbox::default_externals();
    externals.push(ExternalDependency {
        binding_name: "Answer".into(),
        specifier: "answer-lib".into(),
        runtime_value: RuntimeValue::Expression("({ value: 42 })".into()),
    });
    let registry = Arc::new(DependencyRegistry::new(externals).unwrap());
    let source = r#"
import React from "react";
import { value as answer } from "answer-lib";
export default function App() {
  return React.createElement("b", null, answer);
}
"#;
    let program = finish(&config, &registry, source).await;
    let mut host = ExecutionHost::new(&config, registry).unwrap();

    let outcome = host.run(&program).await.unwrap();
    assert_eq!(outcome.error, None);
    assert_eq!(host.container_html().unwrap(), r#"<div id="root"><b>42</b></div>"#);
}

#[tokio::test]
async fn test_internal_commonjs_and_stylesheet_modules() {
    let assets = tempdir().unwrap();
    fs::write(
        assets.path().join("widget.js"),
        "var React = require('react');\nmodule.exports = function Widget() { return React.createElement('i', null, 'w'); };\n",
    )
    .unwrap();
    fs::write(assets.path().join("theme.css"), "p { color: red }").unwrap();

    let config = SandboxConfig {
        internal_root: assets.path().to_path_buf(),
        ..Default::default()
    };
    let registry = default_registry();
    let source = r#"
import React from "react";
import Widget from "@local/widget.js";
import "@local/theme.css";
export default function App() {
  return React.createElement(Widget);
}
"#;
    let program = finish(&config, &registry, source).await;
    let mut host = ExecutionHost::new(&config, registry).unwrap();

    let outcome = host.run(&program).await.unwrap();
    assert_eq!(outcome.error, None);
    let html = host.container_html().unwrap();
    assert!(html.contains(r#"<div id="root"><i>w</i></div>"#), "{}", html);
    assert!(html.contains(r#"<style data-module="internal:theme.css">p { color: red }</style>"#), "{}", html);
}

#[tokio::test]
async fn test_busy_indicator_is_an_overlay() {
    let config = SandboxConfig::default();
    let registry = default_registry();
    let program = finish(&config, &registry, "export default function App() { return 'kept'; }").await;
    let mut host = ExecutionHost::new(&config, registry).unwrap();
    host.run(&program).await.unwrap();
    let rendered = host.container_html().unwrap();

    host.begin_loading().unwrap();
    assert!(host.busy_visible().unwrap());
    assert_eq!(host.container_html().unwrap(), rendered);
    assert!(host.region_html().unwrap().contains("Loading..."));

    host.finish_loading().unwrap();
    assert!(!host.busy_visible().unwrap());
    assert_eq!(host.state(), HostState::Ready);
}

#[tokio::test]
async fn test_previous_render_is_unmounted_before_next_run() {
    let config = SandboxConfig::default();
    let registry = default_registry();
    let first = finish(
        &config,
        &registry,
        r#"
import { useEffect } from "react";
export default function App() {
  useEffect(() => () => console.log("cleanup"), []);
  return "first";
}
"#,
    )
    .await;
    let second = finish(&config, &registry, "export default function App() { return 'second'; }").await;
    let mut host = ExecutionHost::new(&config, registry).unwrap();

    host.run(&first).await.unwrap();
    assert!(host.take_console().logs.is_empty());

    host.run(&second).await.unwrap();
    assert_eq!(host.take_console().logs, vec!["cleanup".to_string()]);
    assert_eq!(host.container_html().unwrap(), r#"<div id="root">second</div>"#);
}

#[tokio::test]
async fn test_click_handlers_update_state() {
    let config = SandboxConfig::default();
    let registry = default_registry();
    let source = r#"
import React, { useState } from "react";
export default function App() {
  const [on, setOn] = useState(false);
  return React.createElement("button", { id: "b", onClick: () => setOn(!on) }, on ? "on" : "off");
}
"#;
    let program = format!(
        "{}\ncontainer.querySelector('#b').click();",
        finish(&config, &registry, source).await.replacen("return (function (exported)", "var __mounted = (function (exported)", 1)
    );
    let program = format!("{}\nreturn __mounted;", program);
    let mut host = ExecutionHost::new(&config, registry).unwrap();

    let outcome = host.run(&program).await.unwrap();
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.mount, Some(MountOutcome::Found { component: "App".into() }));
    assert_eq!(
        host.container_html().unwrap(),
        r#"<div id="root"><button id="b">on</button></div>"#
    );
}

#[tokio::test]
async fn test_timeout_terminates_and_host_recovers() {
    let config = SandboxConfig {
        timeout_ms: Some(200),
        ..Default::default()
    };
    let registry = default_registry();
    let mut host = ExecutionHost::new(&config, registry).unwrap();

    let outcome = host.run("while (true) {}").await.unwrap();
    let error = outcome.error.unwrap();
    assert_eq!(error.name, "TimeoutError");
    assert!(error.message.contains("200ms"));
    assert_eq!(host.state(), HostState::Error);

    let outcome = host.run("return { kind: 'Found', component: 'Again' };").await.unwrap();
    assert_eq!(outcome.mounted_component(), Some("Again"));
}

#[tokio::test]
async fn test_same_local_bound_to_different_exports_across_modules() {
    let assets = tempdir().unwrap();
    fs::write(
        assets.path().join("label.js"),
        "import { Fragment as h } from 'react';\nexport default function Label() { return typeof h === 'symbol' ? 'fragment' : 'wrong'; }\n",
    )
    .unwrap();
    let config = SandboxConfig {
        internal_root: assets.path().to_path_buf(),
        ..Default::default()
    };
    let registry = default_registry();
    let source = r#"
import { createElement as h } from "react";
import Label from "@local/label.js";
export default function App() {
  return h("em", null, h(Label));
}
"#;
    let program = finish(&config, &registry, source).await;
    let mut host = ExecutionHost::new(&config, registry).unwrap();

    let outcome = host.run(&program).await.unwrap();
    assert_eq!(outcome.error, None);
    assert_eq!(host.container_html().unwrap(), r#"<div id="root"><em>fragment</em></div>"#);
}

#[tokio::test]
async fn test_timeout_covers_promise_jobs() {
    let config = SandboxConfig {
        timeout_ms: Some(200),
        ..Default::default()
    };
    let registry = default_registry();
    let mut host = ExecutionHost::new(&config, registry).unwrap();

    let program = "Promise.resolve().then(() => { while (true) {} });\nreturn { kind: 'Found', component: 'Spinner' };";
    let outcome = host.run(program).await.unwrap();
    let error = outcome.error.unwrap();
    assert_eq!(error.name, "TimeoutError");
    assert_eq!(host.state(), HostState::Error);

    let outcome = host.run("return { kind: 'Found', component: 'Again' };").await.unwrap();
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.mounted_component(), Some("Again"));
}

#[tokio::test]
async fn test_timeout_covers_async_loop_in_effect() {
    let config = SandboxConfig {
        timeout_ms: Some(200),
        ..Default::default()
    };
    let registry = default_registry();
    let source = r#"
import { useEffect } from "react";
export default function App() {
  useEffect(() => {
    (async () => {
      for (;;) await 0;
    })();
  }, []);
  return "spinning";
}
"#;
    let program = finish(&config, &registry, source).await;
    let mut host = ExecutionHost::new(&config, registry).unwrap();

    let outcome = host.run(&program).await.unwrap();
    assert_eq!(outcome.error.unwrap().name, "TimeoutError");
}

#[tokio::test]
async fn test_unhandled_rejection_is_an_execution_error() {
    let config = SandboxConfig::default();
    let registry = default_registry();
    let source = r#"
import { useEffect } from "react";
export default function App() {
  useEffect(() => {
    Promise.reject(new RangeError("late failure"));
  }, []);
  return "mounted";
}
"#;
    let program = finish(&config, &registry, source).await;
    let mut host = ExecutionHost::new(&config, registry).unwrap();

    let outcome = host.run(&program).await.unwrap();
    assert_eq!(outcome.mounted_component(), Some("App"));
    let error = outcome.error.unwrap();
    assert!(error.message.contains("late failure"), "{:?}", error);
    assert_eq!(host.state(), HostState::Error);
    assert_eq!(host.container_html().unwrap(), r#"<div id="root">mounted</div>"#);
}

#[test]
fn test_fullscreen_toggle_and_teardown() {
    let config = SandboxConfig::default();
    let mut host = ExecutionHost::new(&config, default_registry()).unwrap();

    assert_eq!(host.listener_count().unwrap(), 1);
    assert_eq!(host.toggle_fullscreen().unwrap(), "Exit Fullscreen");
    assert!(host.region_html().unwrap().contains("preview-host fullscreen"));
    assert_eq!(host.toggle_fullscreen().unwrap(), "Fullscreen");

    host.teardown().unwrap();
    assert!(!host.is_attached());
    assert_eq!(host.listener_count().unwrap(), 0);
    assert_eq!(host.region_html().unwrap(), "");
    assert!(host.toggle_fullscreen().is_err());

    host.attach().unwrap();
    assert_eq!(host.listener_count().unwrap(), 1);
}
