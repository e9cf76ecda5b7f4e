// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rendering of drained buckets into the text sent to the chat.
//!
//! Output is Telegram flavoured HTML. Rendering is deterministic: the same snapshot and settings
//! always produce byte-identical text.

use std::fmt::Write as _;

use chrono::NaiveDateTime;
use chrono_tz::Tz;
use derive_more::Display;
use hashbrown::HashSet;
use url::form_urlencoded;

use crate::aggregator::{Bucket, Snapshot};
use crate::config::AlertConfig;
use crate::errors::RenderError;
use crate::event::{source_label, Event, HostInfo};

/// Buckets with more flow ids than this link to the rule only, keeping the URL short.
const MAX_LINKED_FLOW_IDS: usize = 10;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S (%Z)";
const GROUP_LINK_TEXT: &str = "View All Alerts in NAD";
const SESSION_LINK_TEXT: &str = "View Session in NAD";
const NOT_AVAILABLE: &str = "N/A";

pub const STARTUP_MESSAGE: &str = "🚀 NAD bot has started.";

/// Rendered text, detached from the buckets it was built from.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub struct Digest(String);

impl Digest {
    pub fn new(text: impl Into<String>) -> Self {
        Digest(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub trait DigestRenderer: Send + Sync {
    /// Renders a non-empty snapshot.
    fn render(&self, snapshot: &Snapshot) -> Result<Digest, RenderError>;
}

/// Colour square for a rule priority.
pub fn priority_indicator(priority: u8) -> &'static str {
    match priority {
        1 => "🟥",
        2 => "🟨",
        3 => "🟦",
        _ => "⬜",
    }
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[derive(Debug, Clone)]
pub struct HtmlDigestRenderer {
    timezone: Tz,
    force_session_link: bool,
    show_source_label: bool,
}

impl HtmlDigestRenderer {
    pub fn new(config: &AlertConfig) -> Self {
        HtmlDigestRenderer {
            timezone: config.display_timezone,
            force_session_link: config.force_session_link,
            show_source_label: config.show_nad_source,
        }
    }

    fn format_timestamp(&self, ts: Option<NaiveDateTime>) -> String {
        match ts {
            Some(ts) => ts
                .and_utc()
                .with_timezone(&self.timezone)
                .format(TIMESTAMP_FORMAT)
                .to_string(),
            None => NOT_AVAILABLE.to_string(),
        }
    }

    fn timestamp_line(&self, bucket: &Bucket) -> String {
        if bucket.len() == 1 {
            return self.format_timestamp(bucket.first().rule.timestamp);
        }
        let timestamps = bucket.events.iter().filter_map(|e| e.rule.timestamp);
        let earliest = timestamps.clone().min();
        let latest = timestamps.max();
        if earliest == latest {
            self.format_timestamp(earliest)
        } else {
            format!(
                "{} - {}",
                self.format_timestamp(earliest),
                self.format_timestamp(latest)
            )
        }
    }

    fn render_bucket(&self, bucket: &Bucket) -> Result<String, RenderError> {
        let first = bucket.first();
        let rule = &first.rule;
        let mut out = String::new();

        let _ = write!(
            out,
            "{} <b>{}</b>",
            priority_indicator(rule.priority),
            escape_html(&rule.message)
        );
        if bucket.len() > 1 {
            let _ = write!(out, " ({} occurrences)", bucket.len());
        }

        let mut protocol = format!(
            "<b>Protocol:</b> <code>{}</code>",
            escape_html(first.proto.as_deref().unwrap_or(NOT_AVAILABLE))
        );
        if let Some(app_proto) = first.app_proto.as_deref() {
            let _ = write!(protocol, " (<code>{}</code>)", escape_html(app_proto));
        }

        let _ = write!(
            out,
            "\n<b>Source:</b> {}\n<b>Destination:</b> {}\n<b>Classification:</b> {}\n{}\n<b>SID:</b> <code>{}</code>\n<b>Timestamp:</b> {}\n",
            format_endpoints(bucket.events.iter().map(|e| &e.src)),
            format_endpoints(bucket.events.iter().map(|e| &e.dst)),
            escape_html(rule.classification.as_deref().unwrap_or(NOT_AVAILABLE)),
            protocol,
            rule.sid,
            self.timestamp_line(bucket),
        );

        let (link_text, link_url) = if bucket.len() == 1 && self.force_session_link {
            (SESSION_LINK_TEXT, first.flow_url.to_string())
        } else {
            (GROUP_LINK_TEXT, group_link(bucket)?)
        };
        let _ = write!(out, "<b>🔍 <a href=\"{link_url}\">{link_text}</a></b>");
        if self.show_source_label {
            let _ = write!(out, " ({})", source_label(&first.flow_url));
        }

        Ok(out)
    }
}

impl DigestRenderer for HtmlDigestRenderer {
    fn render(&self, snapshot: &Snapshot) -> Result<Digest, RenderError> {
        let total = snapshot.event_count();
        let mut text = if total == 1 {
            "<b>🚨 New Alert:</b>\n\n".to_string()
        } else {
            format!(
                "<b>🚨 {} New Alerts ({} Unique):</b>\n\n",
                total,
                snapshot.bucket_count()
            )
        };

        let sections = snapshot
            .buckets
            .iter()
            .map(|bucket| self.render_bucket(bucket))
            .collect::<Result<Vec<_>, _>>()?;
        text.push_str(&sections.join("\n\n"));

        Ok(Digest(text.trim_end().to_string()))
    }
}

/// `ip[:port]` when every event agrees on the address, otherwise a count of distinct ones.
fn format_endpoints<'a>(hosts: impl Iterator<Item = &'a HostInfo>) -> String {
    let mut ips: Vec<&str> = Vec::new();
    let mut ports: HashSet<u16> = HashSet::new();
    for host in hosts {
        if let Some(ip) = host.ip.as_deref().filter(|ip| !ip.is_empty()) {
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        if let Some(port) = host.port.filter(|p| *p != 0) {
            ports.insert(port);
        }
    }

    match (ips.as_slice(), ports.len()) {
        ([ip], 1) => {
            let port = ports.iter().next().copied().unwrap_or_default();
            format!("<code>{}:{port}</code>", escape_html(ip))
        }
        ([ip], _) => format!("<code>{}</code>", escape_html(ip)),
        (ips, _) => format!("<i>({} different IP addresses)</i>", ips.len()),
    }
}

/// Query on the source system listing the bucket's alerts, starting at the earliest flow.
fn group_link(bucket: &Bucket) -> Result<String, RenderError> {
    let first = bucket.first();
    let earliest = bucket
        .events
        .iter()
        .filter_map(|e| e.ts_start)
        .min()
        .ok_or(RenderError::MissingStartTime {
            sid: first.rule.sid,
        })?;

    let flow_ids: Vec<&str> = bucket
        .events
        .iter()
        .filter_map(|e| e.flow_id.as_deref())
        .collect();

    let mut filter = format!("alert.sid == {}", first.rule.sid);
    if !flow_ids.is_empty() && flow_ids.len() <= MAX_LINKED_FLOW_IDS {
        let quoted: Vec<String> = flow_ids.iter().map(|id| format!("'{id}'")).collect();
        let _ = write!(filter, " && id in [{}]", quoted.join(", "));
    }

    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("from", &earliest.and_utc().timestamp_millis().to_string())
        .append_pair("sources", "2")
        .append_pair("filter", &filter)
        .finish();

    Ok(format!("{}/#/alerts/list?{}", origin(first), query))
}

fn origin(event: &Event) -> String {
    format!(
        "{}://{}",
        event.flow_url.scheme(),
        source_label(&event.flow_url)
    )
}
