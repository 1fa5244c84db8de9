//! Ordering guarantees of concurrent tool dispatch, driven by model turns.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{ScriptedProvider, Turn};
use weft::agent::{AgentRuntime, AgentTemplate, AgentTemplates, RunOptions, RunState};
use weft::config::WeftConfig;
use weft::tools::{
    register_builtins, AgentTool, AgentToolParameters, CustomToolDefinition, FsResourceStore,
    MemoryResourceStore, ResourceStore, ToolOutput, ToolRegistry,
};

/// `append` waits `delay_ms` between reading and writing its resource, and
/// logs its text when done.
fn append_tool(log: Arc<Mutex<Vec<String>>>) -> (CustomToolDefinition, AgentTool) {
    let parameters = AgentToolParameters::object()
        .string("path", "File to append to", true)
        .string("text", "Text to append", true)
        .integer("delay_ms", "Pause before writing", false)
        .build();
    let definition = CustomToolDefinition::new("append", "Append text", parameters.clone())
        .keyed_by("path");
    let tool = AgentTool::new("append", "Append text", parameters, move |args, ctx| {
        let log = Arc::clone(&log);
        async move {
            let text = args.get_str("text")?.to_string();
            let delay = args.get_i64("delay_ms").unwrap_or(0);
            let slot = ctx.resource()?;
            let current = slot.current().await?.unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            slot.commit(&format!("{current}{text}")).await?;
            log.lock().unwrap().push(text.clone());
            Ok(ToolOutput::new(json!({ "text": text })))
        }
    });
    (definition, tool)
}

fn runtime_with(
    provider: Arc<ScriptedProvider>,
    store: Arc<dyn ResourceStore>,
    extra: impl FnOnce(&mut ToolRegistry),
    tools: Vec<String>,
) -> AgentRuntime {
    let mut registry = ToolRegistry::new();
    register_builtins(&mut registry, store.clone(), &WeftConfig::default());
    extra(&mut registry);
    AgentRuntime::builder()
        .provider(provider)
        .templates(
            AgentTemplates::new().with(AgentTemplate::builder().id("editor").tool_names(tools).build()),
        )
        .store(store)
        .registry(registry)
        .build()
}

fn result_texts(run: &RunState) -> Vec<serde_json::Value> {
    run.session_state
        .main_agent_state
        .messages
        .iter()
        .flat_map(|m| m.tool_results())
        .map(|r| r.content.clone())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn same_resource_calls_run_in_issuance_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (definition, tool) = append_tool(Arc::clone(&log));
    let provider = Arc::new(ScriptedProvider::new(vec![Turn::text_in_pieces(
        concat!(
            "<append><path>/a.txt</path><text>A1</text><delay_ms>100</delay_ms></append>",
            "<append><path>/b.txt</path><text>B1</text></append>",
            "<append><path>/a.txt</path><text>A2</text></append>",
        ),
        7,
    )]));
    let store = Arc::new(MemoryResourceStore::new());
    let runtime = runtime_with(
        provider,
        store.clone(),
        |registry| registry.register_custom(definition, Arc::new(tool)).unwrap(),
        vec!["append".into()],
    );

    let run = runtime
        .run(RunOptions::builder().agent_type("editor").prompt("go").build())
        .await;

    assert_eq!(store.get("/a.txt").await.as_deref(), Some("A1A2"));
    assert_eq!(store.get("/b.txt").await.as_deref(), Some("B1"));
    // B1 overtakes A1; A2 waits for A1.
    assert_eq!(*log.lock().unwrap(), vec!["B1", "A1", "A2"]);
    // The transcript keeps issuance order.
    assert_eq!(
        result_texts(&run),
        vec![json!({ "text": "A1" }), json!({ "text": "B1" }), json!({ "text": "A2" })]
    );
}

#[tokio::test]
async fn concurrent_replacements_match_sequential_application() {
    let provider = Arc::new(ScriptedProvider::new(vec![Turn::text(concat!(
        "<str_replace><path>v.txt</path><old>1</old><new>2</new></str_replace>",
        "<str_replace><path>v.txt</path><old>2</old><new>3</new></str_replace>",
        "<str_replace><path>v.txt</path><old>3</old><new>4</new></str_replace>",
    ))]));
    let store = Arc::new(MemoryResourceStore::new());
    store.insert("v.txt", "x = 1").await;
    let runtime = runtime_with(provider, store.clone(), |_| {}, vec!["str_replace".into()]);

    let run = runtime
        .run(RunOptions::builder().agent_type("editor").prompt("bump").build())
        .await;

    assert_eq!(store.get("v.txt").await.as_deref(), Some("x = 4"));
    let results = result_texts(&run);
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r["replacements"] == 1));
}

#[tokio::test]
async fn failing_and_panicking_handlers_are_isolated() {
    let provider = Arc::new(ScriptedProvider::new(vec![Turn::text(concat!(
        "<explode></explode>",
        "<str_replace><path>missing.txt</path><old>a</old><new>b</new></str_replace>",
        "<write_file><path>ok.txt</path><content>fine</content></write_file>",
    ))]));
    let store = Arc::new(MemoryResourceStore::new());
    let runtime = runtime_with(
        provider,
        store.clone(),
        |registry| {
            registry
                .register_tool(AgentTool::new(
                    "explode",
                    "Always panics",
                    AgentToolParameters::empty(),
                    |_args, _ctx| async move {
                        if true {
                            panic!("boom");
                        }
                        Ok(ToolOutput::default())
                    },
                ))
                .unwrap()
        },
        vec!["explode".into(), "str_replace".into(), "write_file".into()],
    );

    let run = runtime
        .run(RunOptions::builder().agent_type("editor").prompt("go").build())
        .await;

    assert!(!run.output.is_error());
    let results = result_texts(&run);
    assert_eq!(results[0], json!({ "error": "Tool 'explode' failed unexpectedly" }));
    assert!(results[1]["error"].as_str().unwrap().contains("missing.txt does not exist"));
    assert_eq!(results[2], json!({ "path": "ok.txt", "bytes": 4 }));
    assert_eq!(store.get("ok.txt").await.as_deref(), Some("fine"));
}

#[tokio::test]
async fn different_spellings_of_one_path_share_a_queue() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let (definition, tool) = append_tool(Arc::clone(&log));
    let provider = Arc::new(ScriptedProvider::new(vec![Turn::text(concat!(
        "<append><path>/a.txt</path><text>A1</text><delay_ms>50</delay_ms></append>",
        "<append><path>a.txt</path><text>A2</text></append>",
        "<append><path>./a.txt</path><text>A3</text></append>",
    ))]));
    let store = Arc::new(FsResourceStore::new(dir.path()));
    let runtime = runtime_with(
        provider,
        store.clone(),
        |registry| registry.register_custom(definition, Arc::new(tool)).unwrap(),
        vec!["append".into()],
    );

    runtime
        .run(RunOptions::builder().agent_type("editor").prompt("go").build())
        .await;

    assert_eq!(store.read("a.txt").await.unwrap().as_deref(), Some("A1A2A3"));
    assert_eq!(*log.lock().unwrap(), vec!["A1", "A2", "A3"]);
}

#[tokio::test(start_paused = true)]
async fn reads_wait_for_earlier_writes_to_the_same_path() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (definition, tool) = append_tool(Arc::clone(&log));
    let provider = Arc::new(ScriptedProvider::new(vec![Turn::text(concat!(
        "<append><path>/a.txt</path><text>A1</text><delay_ms>100</delay_ms></append>",
        r#"<read_files>{"paths": ["/a.txt", "/b.txt"]}</read_files>"#,
        "<append><path>/a.txt</path><text>A2</text></append>",
    ))]));
    let store = Arc::new(MemoryResourceStore::new());
    store.insert("/b.txt", "B").await;
    let runtime = runtime_with(
        provider,
        store.clone(),
        |registry| registry.register_custom(definition, Arc::new(tool)).unwrap(),
        vec!["append".into(), "read_files".into()],
    );

    let run = runtime
        .run(RunOptions::builder().agent_type("editor").prompt("go").build())
        .await;

    // The read sees A1 but not A2, which was issued after it.
    assert_eq!(result_texts(&run)[1], json!({ "/a.txt": "A1", "/b.txt": "B" }));
    assert_eq!(store.get("/a.txt").await.as_deref(), Some("A1A2"));
}
