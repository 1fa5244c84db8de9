//! Incremental extraction of tool-call tags from free text.
//!
//! The extractor is fed chunks of arbitrary size. Only a partial `<...`
//! delimiter is ever held back between chunks, and that window is bounded by
//! `max_tag_len`; everything else is emitted as soon as it is classified.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default bound on a single buffered tag delimiter, in bytes.
pub const DEFAULT_MAX_TAG_LEN: usize = 256;

const REASONING_TAGS: [&str; 2] = ["think", "thinking"];

/// Event produced by the extractor.
///
/// `Text` and `Reasoning` are streaming deltas: how they are split depends on
/// chunk boundaries, so compare sequences with [`coalesce_events`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TagEvent {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolOpen {
        name: String,
    },
    ToolClose {
        name: String,
        attributes: BTreeMap<String, String>,
        body: String,
    },
    Error {
        name: String,
        message: String,
    },
}

/// What to do with tags whose name is not a recognized tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownTagPolicy {
    /// Extract them as opaque custom tools; validation decides later.
    #[default]
    CustomTool,
    /// Leave them in the plain text.
    Text,
}

/// Result of [`TagExtractor::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionSummary {
    /// Events flushed at end of stream.
    pub events: Vec<TagEvent>,
    /// SHA-256 hex digest of all plain text emitted over the stream.
    pub text_hash: String,
}

#[derive(Debug)]
enum Mode {
    Outside,
    Reasoning { tag: String },
    Tool(OpenTool),
    /// Swallowing a malformed segment up to its matching close. `raw` keeps
    /// the segment so it can be returned as text if the close never comes.
    Discard {
        name: String,
        depth: usize,
        raw: String,
    },
}

#[derive(Debug)]
struct OpenTool {
    name: String,
    attributes: BTreeMap<String, String>,
    body: String,
    param: Option<(String, String)>,
    raw: String,
}

#[derive(Debug, PartialEq)]
enum TagKind {
    Open,
    Close,
    SelfClosing,
}

#[derive(Debug)]
struct ParsedTag {
    kind: TagKind,
    name: String,
    attributes: BTreeMap<String, String>,
}

/// Stateful tool-tag extractor.
///
/// Tags and errors come out the same however the input is chunked. Text and
/// reasoning deltas are split at chunk boundaries, so two chunkings of one
/// stream produce equal sequences only after [`coalesce_events`].
pub struct TagExtractor {
    tools: HashSet<String>,
    unknown: UnknownTagPolicy,
    max_tag_len: usize,
    mode: Mode,
    pending: Option<String>,
    text: String,
    reasoning: String,
    events: Vec<TagEvent>,
    hasher: Sha256,
}

impl TagExtractor {
    pub fn new<I, S>(tool_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tools: tool_names.into_iter().map(Into::into).collect(),
            unknown: UnknownTagPolicy::default(),
            max_tag_len: DEFAULT_MAX_TAG_LEN,
            mode: Mode::Outside,
            pending: None,
            text: String::new(),
            reasoning: String::new(),
            events: Vec::new(),
            hasher: Sha256::new(),
        }
    }

    pub fn with_unknown_tags(mut self, policy: UnknownTagPolicy) -> Self {
        self.unknown = policy;
        self
    }

    pub fn with_max_tag_len(mut self, max_tag_len: usize) -> Self {
        self.max_tag_len = max_tag_len.max(2);
        self
    }

    /// Feed one chunk and collect the events it completes.
    pub fn push(&mut self, chunk: &str) -> Vec<TagEvent> {
        for c in chunk.chars() {
            self.feed(c);
        }
        self.flush_deltas();
        std::mem::take(&mut self.events)
    }

    /// Flush everything still buffered at end of stream.
    pub fn finish(mut self) -> ExtractionSummary {
        if let Some(pending) = self.pending.take() {
            self.literal(&pending);
        }
        match std::mem::replace(&mut self.mode, Mode::Outside) {
            Mode::Tool(tool) => {
                self.flush_deltas();
                self.events.push(TagEvent::Error {
                    message: format!("stream ended before </{}>", tool.name),
                    name: tool.name,
                });
                self.text.push_str(&tool.raw);
            }
            Mode::Discard { raw, .. } => self.text.push_str(&raw),
            Mode::Reasoning { .. } | Mode::Outside => {}
        }
        self.flush_deltas();
        ExtractionSummary {
            events: self.events,
            text_hash: format!("{:x}", self.hasher.finalize()),
        }
    }

    fn feed(&mut self, c: char) {
        if let Some(mut pending) = self.pending.take() {
            pending.push(c);
            if c == '>' {
                self.on_tag(pending);
            } else if c == '<' {
                pending.pop();
                self.literal(&pending);
                self.pending = Some("<".to_string());
            } else if pending.len() > self.max_tag_len || !could_be_tag(&pending) {
                self.literal(&pending);
            } else {
                self.pending = Some(pending);
            }
            return;
        }
        if c == '<' {
            self.pending = Some("<".to_string());
        } else {
            self.literal_char(c);
        }
    }

    fn literal(&mut self, s: &str) {
        for c in s.chars() {
            self.literal_char(c);
        }
    }

    fn literal_char(&mut self, c: char) {
        match &mut self.mode {
            Mode::Outside => self.text.push(c),
            Mode::Reasoning { .. } => self.reasoning.push(c),
            Mode::Tool(tool) => {
                tool.raw.push(c);
                match &mut tool.param {
                    Some((_, value)) => value.push(c),
                    None => tool.body.push(c),
                }
            }
            Mode::Discard { raw, .. } => raw.push(c),
        }
    }

    fn on_tag(&mut self, raw: String) {
        let Some(tag) = parse_tag(&raw) else {
            self.literal(&raw);
            return;
        };

        match std::mem::replace(&mut self.mode, Mode::Outside) {
            Mode::Outside => self.on_tag_outside(tag, raw),
            Mode::Reasoning { tag: open } => {
                if tag.kind == TagKind::Close && tag.name == open {
                    self.flush_reasoning();
                } else {
                    self.mode = Mode::Reasoning { tag: open };
                    self.literal(&raw);
                }
            }
            Mode::Tool(tool) => self.on_tag_in_tool(tool, tag, raw),
            Mode::Discard {
                name,
                depth,
                raw: mut segment,
            } => {
                let depth = match tag.kind {
                    TagKind::Open if tag.name == name => depth + 1,
                    TagKind::Close if tag.name == name => depth - 1,
                    _ => depth,
                };
                if depth > 0 {
                    segment.push_str(&raw);
                    self.mode = Mode::Discard {
                        name,
                        depth,
                        raw: segment,
                    };
                }
            }
        }
    }

    fn on_tag_outside(&mut self, tag: ParsedTag, raw: String) {
        if tag.kind == TagKind::Open && REASONING_TAGS.contains(&tag.name.as_str()) {
            self.flush_text();
            self.mode = Mode::Reasoning { tag: tag.name };
            return;
        }
        if tag.kind == TagKind::Close || !self.is_tool(&tag.name) {
            self.literal(&raw);
            return;
        }

        self.flush_text();
        self.events.push(TagEvent::ToolOpen {
            name: tag.name.clone(),
        });
        if tag.kind == TagKind::SelfClosing {
            self.events.push(TagEvent::ToolClose {
                name: tag.name,
                attributes: tag.attributes,
                body: String::new(),
            });
        } else {
            self.mode = Mode::Tool(OpenTool {
                name: tag.name,
                attributes: tag.attributes,
                body: String::new(),
                param: None,
                raw,
            });
        }
    }

    fn on_tag_in_tool(&mut self, mut tool: OpenTool, tag: ParsedTag, raw: String) {
        tool.raw.push_str(&raw);

        if let Some((param, mut value)) = tool.param.take() {
            if tag.kind == TagKind::Close && tag.name == param {
                tool.attributes.insert(param, trim_one_newline(&value).to_string());
            } else {
                value.push_str(&raw);
                tool.param = Some((param, value));
            }
            self.mode = Mode::Tool(tool);
            return;
        }

        match tag.kind {
            TagKind::Close if tag.name == tool.name => {
                self.events.push(TagEvent::ToolClose {
                    name: tool.name,
                    attributes: tool.attributes,
                    body: tool.body.trim().to_string(),
                });
            }
            TagKind::Open if tag.name == tool.name => {
                tracing::debug!(tag = %tool.name, "nested tool tag; discarding segment");
                self.events.push(TagEvent::Error {
                    message: format!("nested <{}> tags are not supported", tool.name),
                    name: tool.name.clone(),
                });
                self.mode = Mode::Discard {
                    name: tool.name,
                    depth: 2,
                    raw: tool.raw,
                };
            }
            TagKind::Open => {
                tool.param = Some((tag.name, String::new()));
                self.mode = Mode::Tool(tool);
            }
            TagKind::SelfClosing => {
                tool.attributes.insert(tag.name, String::new());
                self.mode = Mode::Tool(tool);
            }
            TagKind::Close => {
                tool.body.push_str(&raw);
                self.mode = Mode::Tool(tool);
            }
        }
    }

    fn is_tool(&self, name: &str) -> bool {
        self.tools.contains(name) || self.unknown == UnknownTagPolicy::CustomTool
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            let text = std::mem::take(&mut self.text);
            self.hasher.update(text.as_bytes());
            self.events.push(TagEvent::Text { text });
        }
    }

    fn flush_reasoning(&mut self) {
        if !self.reasoning.is_empty() {
            let text = std::mem::take(&mut self.reasoning);
            self.events.push(TagEvent::Reasoning { text });
        }
    }

    fn flush_deltas(&mut self) {
        self.flush_text();
        self.flush_reasoning();
    }
}

/// Merge adjacent text and reasoning deltas.
pub fn coalesce_events(events: impl IntoIterator<Item = TagEvent>) -> Vec<TagEvent> {
    let mut out: Vec<TagEvent> = Vec::new();
    for event in events {
        match (out.last_mut(), event) {
            (Some(TagEvent::Text { text }), TagEvent::Text { text: more }) => text.push_str(&more),
            (Some(TagEvent::Reasoning { text }), TagEvent::Reasoning { text: more }) => {
                text.push_str(&more)
            }
            (_, event) => out.push(event),
        }
    }
    out
}

fn could_be_tag(pending: &str) -> bool {
    let mut chars = pending.chars().skip(1);
    match chars.next() {
        None => true,
        Some('/') => chars.next().map_or(true, is_name_start),
        Some(c) => is_name_start(c),
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(is_name_start)
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.' | '/'))
}

fn parse_tag(raw: &str) -> Option<ParsedTag> {
    let inner = raw.strip_prefix('<')?.strip_suffix('>')?;

    if let Some(name) = inner.strip_prefix('/') {
        let name = name.trim_end();
        return is_valid_name(name).then(|| ParsedTag {
            kind: TagKind::Close,
            name: name.to_string(),
            attributes: BTreeMap::new(),
        });
    }

    let (inner, kind) = match inner.strip_suffix('/') {
        Some(rest) => (rest, TagKind::SelfClosing),
        None => (inner, TagKind::Open),
    };
    let name_end = inner.find(char::is_whitespace).unwrap_or(inner.len());
    let name = &inner[..name_end];
    if !is_valid_name(name) {
        return None;
    }
    Some(ParsedTag {
        kind,
        name: name.to_string(),
        attributes: parse_attributes(&inner[name_end..])?,
    })
}

fn parse_attributes(input: &str) -> Option<BTreeMap<String, String>> {
    let mut attributes = BTreeMap::new();
    let mut rest = input.trim_start();

    while !rest.is_empty() {
        let key_end = rest
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(rest.len());
        let key = &rest[..key_end];
        if !is_valid_name(key) {
            return None;
        }
        rest = rest[key_end..].trim_start();

        let value = if let Some(after_eq) = rest.strip_prefix('=') {
            let after_eq = after_eq.trim_start();
            match after_eq.chars().next() {
                Some(quote @ ('"' | '\'')) => {
                    let body = &after_eq[1..];
                    let close = body.find(quote)?;
                    rest = &body[close + 1..];
                    body[..close].to_string()
                }
                Some(_) => {
                    let end = after_eq.find(char::is_whitespace).unwrap_or(after_eq.len());
                    rest = &after_eq[end..];
                    after_eq[..end].to_string()
                }
                None => return None,
            }
        } else {
            String::new()
        };

        attributes.insert(key.to_string(), value);
        rest = rest.trim_start();
    }

    Some(attributes)
}

fn trim_one_newline(value: &str) -> &str {
    let value = value.strip_prefix('\n').unwrap_or(value);
    value.strip_suffix('\n').unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn extractor() -> TagExtractor {
        TagExtractor::new(["write_file", "tool_call", "end_turn"])
    }

    fn run_chunks(chunks: &[&str]) -> Vec<TagEvent> {
        let mut extractor = extractor();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(extractor.push(chunk));
        }
        events.extend(extractor.finish().events);
        coalesce_events(events)
    }

    fn text(s: &str) -> TagEvent {
        TagEvent::Text { text: s.into() }
    }

    #[test]
    fn empty_input_produces_no_events() {
        let mut extractor = extractor();
        assert!(extractor.push("").is_empty());
        let summary = extractor.finish();
        assert!(summary.events.is_empty());
        assert_eq!(
            summary.text_hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn split_tag_name_does_not_leak_partial_tag() {
        let mut extractor = extractor();
        let first = extractor.push("hello <tool_c");
        assert_eq!(first, vec![text("hello ")]);
        let second = extractor.push("all id=1>");
        assert_eq!(
            second,
            vec![TagEvent::ToolOpen {
                name: "tool_call".into()
            }]
        );
    }

    #[test]
    fn collects_attributes_from_open_tag_and_params() {
        let events = run_chunks(&[
            "Writing now.\n<write_file mode=\"overwrite\">\n<path>src/a.rs</path>\n<content>\nfn main() {}\n</content>\n</write_file>",
        ]);
        let mut attributes = BTreeMap::new();
        attributes.insert("mode".to_string(), "overwrite".to_string());
        attributes.insert("path".to_string(), "src/a.rs".to_string());
        attributes.insert("content".to_string(), "fn main() {}".to_string());
        assert_eq!(
            events,
            vec![
                text("Writing now.\n"),
                TagEvent::ToolOpen {
                    name: "write_file".into()
                },
                TagEvent::ToolClose {
                    name: "write_file".into(),
                    attributes,
                    body: String::new(),
                },
            ]
        );
    }

    #[test]
    fn param_content_keeps_inner_markup_literal() {
        let events = run_chunks(&[
            "<write_file><path>index.html</path><content><div>a<b</div></content></write_file>",
        ]);
        let TagEvent::ToolClose { attributes, .. } = &events[1] else {
            panic!("expected tool close, got {events:?}");
        };
        assert_eq!(attributes["content"], "<div>a<b</div>");
    }

    #[test]
    fn json_body_is_returned_verbatim() {
        let events = run_chunks(&["<tool_call>{\"cmd\": \"ls\"}</tool_call>"]);
        assert_eq!(
            events[1],
            TagEvent::ToolClose {
                name: "tool_call".into(),
                attributes: BTreeMap::new(),
                body: "{\"cmd\": \"ls\"}".into(),
            }
        );
    }

    #[test]
    fn unknown_tags_become_custom_tools_by_default() {
        let events = run_chunks(&["<mcp/search q=rust/>"]);
        assert_eq!(
            events,
            vec![
                TagEvent::ToolOpen {
                    name: "mcp/search".into()
                },
                TagEvent::ToolClose {
                    name: "mcp/search".into(),
                    attributes: BTreeMap::from([("q".to_string(), "rust".to_string())]),
                    body: String::new(),
                },
            ]
        );
    }

    #[test]
    fn unknown_tags_stay_text_when_configured() {
        let mut extractor = extractor().with_unknown_tags(UnknownTagPolicy::Text);
        let mut events = extractor.push("see <b>bold</b>");
        events.extend(extractor.finish().events);
        assert_eq!(coalesce_events(events), vec![text("see <b>bold</b>")]);
    }

    #[test]
    fn comparison_operators_are_plain_text() {
        let events = run_chunks(&["if a < b && c<5 then x<y && z>"]);
        assert_eq!(events, vec![text("if a < b && c<5 then x<y && z>")]);
    }

    #[test]
    fn reasoning_segments_are_separated() {
        let events = run_chunks(&["<think>plan it</think>done"]);
        assert_eq!(
            events,
            vec![
                TagEvent::Reasoning {
                    text: "plan it".into()
                },
                text("done"),
            ]
        );
    }

    #[test]
    fn nested_same_name_tag_is_an_error_for_that_tag_only() {
        let events = run_chunks(&[
            "<write_file><write_file><path>x</path></write_file></write_file>after<end_turn/>",
        ]);
        assert_eq!(
            events,
            vec![
                TagEvent::ToolOpen {
                    name: "write_file".into()
                },
                TagEvent::Error {
                    name: "write_file".into(),
                    message: "nested <write_file> tags are not supported".into(),
                },
                text("after"),
                TagEvent::ToolOpen {
                    name: "end_turn".into()
                },
                TagEvent::ToolClose {
                    name: "end_turn".into(),
                    attributes: BTreeMap::new(),
                    body: String::new(),
                },
            ]
        );
    }

    #[test]
    fn unclosed_nested_segment_is_returned_as_text_at_end() {
        let events = run_chunks(&["<write_file><write", "_file>abc <pa"]);
        assert_eq!(
            events,
            vec![
                TagEvent::ToolOpen {
                    name: "write_file".into()
                },
                TagEvent::Error {
                    name: "write_file".into(),
                    message: "nested <write_file> tags are not supported".into(),
                },
                text("<write_file><write_file>abc <pa"),
            ]
        );
    }

    #[test]
    fn partial_delimiter_is_flushed_as_text_at_end() {
        let events = run_chunks(&["tail <write_fi"]);
        assert_eq!(events, vec![text("tail <write_fi")]);
    }

    #[test]
    fn unterminated_tool_reports_error_and_keeps_raw_text() {
        let events = run_chunks(&["<write_file><path>a"]);
        assert_eq!(
            events,
            vec![
                TagEvent::ToolOpen {
                    name: "write_file".into()
                },
                TagEvent::Error {
                    name: "write_file".into(),
                    message: "stream ended before </write_file>".into(),
                },
                text("<write_file><path>a"),
            ]
        );
    }

    #[test]
    fn overlong_delimiter_is_released_as_text() {
        let mut extractor = extractor().with_max_tag_len(8);
        let mut events = extractor.push("<abcdefghijkl");
        events.extend(extractor.finish().events);
        assert_eq!(coalesce_events(events), vec![text("<abcdefghijkl")]);
    }

    #[test]
    fn any_split_point_yields_the_same_events() {
        let input = "pre <think>hm</think> <write_file path=\"/a.txt\"><content>x<y</content></write_file> mid <tool_call id=7>{\"a\":1}</tool_call> end <bogus";
        let whole = run_chunks(&[input]);

        let boundaries: Vec<usize> = input.char_indices().map(|(i, _)| i).collect();
        for &i in &boundaries {
            for &j in boundaries.iter().filter(|&&j| j >= i) {
                let split = run_chunks(&[&input[..i], &input[i..j], &input[j..]]);
                assert_eq!(split, whole, "split at {i}/{j}");
            }
        }
    }

    #[test]
    fn text_hash_is_independent_of_chunking() {
        let mut one = extractor();
        one.push("abc <end_turn/> def");
        let mut two = extractor();
        for c in ["ab", "c <end", "_turn/", "> d", "ef"] {
            two.push(c);
        }
        assert_eq!(one.finish().text_hash, two.finish().text_hash);
    }
}
