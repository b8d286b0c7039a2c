use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use lcmprims::log::LogEvent;
use lcmprims::router::ReceivedMessage;
use serde::Serialize;

const PREVIEW_LIMIT: usize = 64;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One line of `listen` or `dump` output.
#[derive(Serialize)]
struct MessageOutput<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    event_number: Option<u64>,
    channel: &'a str,
    utime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    payload_size: usize,
    payload: String,
}

impl<'a> MessageOutput<'a> {
    fn from_message(message: &'a ReceivedMessage) -> Self {
        Self {
            event_number: None,
            channel: &message.channel,
            utime: message.recv_utime,
            source: message.source.map(|addr| addr.to_string()),
            payload_size: message.payload.len(),
            payload: payload_preview(&message.payload),
        }
    }

    fn from_event(event: &'a LogEvent) -> Self {
        Self {
            event_number: Some(event.event_number),
            channel: &event.channel,
            utime: event.timestamp,
            source: None,
            payload_size: event.payload.len(),
            payload: payload_preview(&event.payload),
        }
    }
}

pub fn print_message(message: &ReceivedMessage, format: OutputFormat) {
    print_output(&MessageOutput::from_message(message), &message.payload, format);
}

pub fn print_event(event: &LogEvent, format: OutputFormat) {
    print_output(&MessageOutput::from_event(event), &event.payload, format);
}

fn print_output(out: &MessageOutput<'_>, payload: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["EVENT", "UTIME", "CHANNEL", "SIZE", "SOURCE", "PAYLOAD"])
                .add_row(vec![
                    out.event_number.map_or("-".to_string(), |n| n.to_string()),
                    out.utime.to_string(),
                    out.channel.to_string(),
                    out.payload_size.to_string(),
                    out.source.clone().unwrap_or_else(|| "-".to_string()),
                    out.payload.clone(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let event = out
                .event_number
                .map_or(String::new(), |n| format!("#{n} "));
            println!(
                "{event}{} channel={} size={} payload={}",
                out.utime, out.channel, out.payload_size, out.payload
            );
        }
        OutputFormat::Raw => print_raw(payload),
    }
}

/// Print any serializable summary in the requested format.
pub fn print_summary<T: Serialize>(title: &str, summary: &T, format: OutputFormat) {
    let value = serde_json::to_value(summary).unwrap_or(serde_json::Value::Null);
    match format {
        OutputFormat::Json => print_json(&value),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![title.to_uppercase(), String::new()]);
            if let serde_json::Value::Object(fields) = &value {
                for (key, field) in fields {
                    table.add_row(vec![key.clone(), plain(field)]);
                }
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            let fields = match &value {
                serde_json::Value::Object(fields) => fields
                    .iter()
                    .map(|(key, field)| format!("{key}={}", plain(field)))
                    .collect::<Vec<_>>()
                    .join(" "),
                other => plain(other),
            };
            println!("{title}: {fields}");
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn plain(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) if text.len() <= PREVIEW_LIMIT => text.to_string(),
        Ok(text) => {
            let cut = (0..=PREVIEW_LIMIT)
                .rev()
                .find(|i| text.is_char_boundary(*i))
                .unwrap_or(0);
            format!("{}...", &text[..cut])
        }
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_of_text_binary_and_long_payloads() {
        assert_eq!(payload_preview(b"hello"), "hello");
        assert_eq!(payload_preview(&[0xFF, 0xFE]), "<binary 2 bytes>");

        let long = "x".repeat(100);
        let preview = payload_preview(long.as_bytes());
        assert_eq!(preview.len(), PREVIEW_LIMIT + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn event_json_has_number_and_no_source() {
        let event = LogEvent {
            event_number: 4,
            timestamp: 99,
            channel: "A".to_string(),
            payload: b"hi".to_vec().into(),
        };
        let json = serde_json::to_string(&MessageOutput::from_event(&event)).unwrap();
        assert!(json.contains("\"event_number\":4"));
        assert!(!json.contains("source"));
    }
}
