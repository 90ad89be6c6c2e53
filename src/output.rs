use std::io::{self, Write};

use chrono::{DateTime, Local, TimeZone};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::realtime::{Event, EventSink};

const PREVIEW_WIDTH: usize = 80;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Plain,
    Json,
}

impl OutputFormat {
    pub fn resolve(json: bool, plain: bool) -> Self {
        if json {
            OutputFormat::Json
        } else if plain {
            OutputFormat::Plain
        } else {
            OutputFormat::Human
        }
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), OutputError> {
    let payload = serde_json::to_string_pretty(value)?;
    println!("{payload}");
    Ok(())
}

pub fn event_sink<'a, W: Write + 'a>(format: OutputFormat, writer: W) -> Box<dyn EventSink + 'a> {
    match format {
        OutputFormat::Json => Box::new(JsonLinesSink::new(writer)),
        OutputFormat::Plain => Box::new(PlainSink::new(writer)),
        OutputFormat::Human => Box::new(HumanSink::new(writer)),
    }
}

/// One compact JSON document per line: the payload exactly as received.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> EventSink for JsonLinesSink<W> {
    fn emit(&mut self, event: &Event) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, &event.raw)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Tab separated: kind, chat id, sequence, comma separated entity ids.
pub struct PlainSink<W> {
    writer: W,
}

impl<W: Write> PlainSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> EventSink for PlainSink<W> {
    fn emit(&mut self, event: &Event) -> io::Result<()> {
        let sequence = event.sequence.map(|seq| seq.to_string()).unwrap_or_default();
        writeln!(
            self.writer,
            "{}\t{}\t{}\t{}",
            tsv_field(event.kind.as_str()),
            tsv_field(event.chat_id.as_deref().unwrap_or_default()),
            sequence,
            tsv_field(&event.entity_ids.join(",")),
        )?;
        self.writer.flush()
    }
}

pub struct HumanSink<W> {
    writer: W,
}

impl<W: Write> HumanSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> EventSink for HumanSink<W> {
    fn emit(&mut self, event: &Event) -> io::Result<()> {
        let line = human_line(event, Local::now());
        writeln!(self.writer, "{line}")?;
        self.writer.flush()
    }
}

fn human_line(event: &Event, received_at: DateTime<Local>) -> String {
    let at = event
        .timestamp
        .and_then(|millis| Local.timestamp_millis_opt(millis).single())
        .unwrap_or(received_at);

    let mut line = format!("[{}] {}", at.format("%H:%M:%S"), event.kind.as_str());
    if let Some(chat_id) = &event.chat_id {
        line.push_str(&format!(" chat={chat_id}"));
    }
    if !event.entity_ids.is_empty() {
        line.push_str(&format!(" ids={}", event.entity_ids.join(",")));
    }
    if let Some(request_id) = &event.request_id {
        line.push_str(&format!(" request={request_id}"));
    }
    if let Some(text) = preview_text(&event.raw) {
        line.push_str("  ");
        line.push_str(&truncate_display(&text, PREVIEW_WIDTH));
    }
    line
}

fn preview_text(raw: &Value) -> Option<String> {
    let text = raw
        .get("text")
        .or_else(|| raw.get("message").and_then(|message| message.get("text")))
        .or_else(|| raw.get("error").and_then(|error| error.get("message")))
        .and_then(Value::as_str)?;
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

fn tsv_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

fn display_width(value: &str) -> usize {
    UnicodeWidthStr::width(value)
}

fn truncate_display(value: &str, max_width: usize) -> String {
    if display_width(value) <= max_width {
        return value.to_string();
    }
    let ellipsis = "...";
    let mut width = 0usize;
    let mut output = String::new();
    for ch in value.chars() {
        let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
        if width + ch_width + ellipsis.len() > max_width {
            break;
        }
        output.push(ch);
        width += ch_width;
    }
    output.push_str(ellipsis);
    output
}
