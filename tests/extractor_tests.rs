//! Tool-tag extraction through the async stream adapter.

use futures::stream::{self, StreamExt};
use pretty_assertions::assert_eq;

use weft::stream_transform::{coalesce_events, extract_tool_tags, TagEvent, TagExtractor, TurnEvent};
use weft::types::StreamChunk;

const TURN: &str = "I'll fix it. <thinking>the bug is in a.rs</thinking>\n\
<str_replace><path>a.rs</path><old>a < b</old><new>a <= b</new></str_replace>\n\
<end_turn/>Done.";

async fn extract(chunks: Vec<String>) -> (Vec<TagEvent>, String) {
    let chunks: Vec<_> = chunks
        .into_iter()
        .map(|text| Ok(StreamChunk::Text { text }))
        .chain([Ok(StreamChunk::Done)])
        .collect();
    let events: Vec<_> = extract_tool_tags(
        stream::iter(chunks).boxed(),
        "test".into(),
        TagExtractor::new(["str_replace", "end_turn"]),
    )
    .collect()
    .await;

    let mut tags = Vec::new();
    let mut hash = String::new();
    for event in events {
        match event.unwrap() {
            TurnEvent::Tag(tag) => tags.push(tag),
            TurnEvent::Finished { text_hash } => hash = text_hash,
            TurnEvent::Usage(_) => {}
        }
    }
    (coalesce_events(tags), hash)
}

fn pieces(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

#[tokio::test]
async fn chunking_never_changes_the_events() {
    let (whole, whole_hash) = extract(vec![TURN.to_string()]).await;

    for size in 1..12 {
        let (split, hash) = extract(pieces(TURN, size)).await;
        assert_eq!(split, whole, "pieces of {size}");
        assert_eq!(hash, whole_hash);
    }
}

#[tokio::test]
async fn a_turn_yields_text_reasoning_and_tool_calls() {
    let (events, _) = extract(pieces(TURN, 5)).await;

    let tools: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TagEvent::ToolClose { name, attributes, .. } => Some((name.as_str(), attributes.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0].0, "str_replace");
    assert_eq!(tools[0].1["old"], "a < b");
    assert_eq!(tools[0].1["new"], "a <= b");
    assert_eq!(tools[1].0, "end_turn");

    assert!(events.contains(&TagEvent::Reasoning {
        text: "the bug is in a.rs".into()
    }));
    assert_eq!(
        events.last(),
        Some(&TagEvent::Text {
            text: "Done.".into()
        })
    );
}
