// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed alert records.
//!
//! Bodies pushed to the webhook are decoded into a loose wire representation first, then checked
//! for the fields the pipeline relies on and turned into an [`Event`]. Everything downstream of
//! the receiving endpoint works with `Event` only.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::errors::ValidationError;

/// Epoch values above this are taken as milliseconds rather than seconds.
const MS_EPOCH_THRESHOLD: f64 = 2e10;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GeoInfo {
    pub location: Option<Vec<f64>>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub asn: Option<u64>,
    pub org: Option<String>,
}

/// One side of the observed network flow.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HostInfo {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub mac: Option<String>,
    pub host_id: Option<String>,
    pub geo: Option<GeoInfo>,
}

/// Detection rule details carried by an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub sid: u64,
    pub message: String,
    pub revision: Option<u32>,
    pub classification: Option<String>,
    pub priority: u8,
    pub severity_group: Option<i64>,
    /// When the rule fired, in UTC.
    pub timestamp: Option<NaiveDateTime>,
    pub tx_id: Option<u64>,
    pub to_client: Option<bool>,
    pub to_server: Option<bool>,
    pub payload: Option<String>,
}

/// A validated alert. Immutable once built; moved from the ingestion queue into exactly one
/// aggregation bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub flow_id: Option<String>,
    /// Detail view of the originating flow on the source system.
    pub flow_url: Url,
    /// Start of the originating flow, in UTC.
    pub ts_start: Option<NaiveDateTime>,
    pub src: HostInfo,
    pub dst: HostInfo,
    pub rule: Rule,
    pub proto: Option<String>,
    pub app_proto: Option<String>,
}

/// Events sharing a key are treated as repeats of the same incident.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupingKey {
    pub sid: u64,
    pub source_label: String,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    flow_id: Option<String>,
    flow_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    ts_start: Option<NaiveDateTime>,
    #[serde(default)]
    src: Option<HostInfo>,
    #[serde(default)]
    dst: Option<HostInfo>,
    alert: Option<RawRule>,
    proto: Option<String>,
    app_proto: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    s_id: Option<u64>,
    s_msg: Option<String>,
    s_rev: Option<u32>,
    s_cls: Option<String>,
    s_pr: Option<u8>,
    s_g: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    ts: Option<NaiveDateTime>,
    tx_id: Option<u64>,
    to_client: Option<bool>,
    to_server: Option<bool>,
    payload: Option<String>,
}

impl Event {
    /// Decodes and validates one webhook body.
    ///
    /// The `type` field must be one of `supported_types`; the rule id, message and priority and a
    /// `flow_url` with a host are required. Unknown fields are ignored.
    pub fn from_json(body: &[u8], supported_types: &[String]) -> Result<Event, ValidationError> {
        let raw: RawEvent =
            serde_json::from_slice(body).map_err(|e| ValidationError::Json(e.to_string()))?;

        match raw.kind.as_deref() {
            Some(kind) if supported_types.iter().any(|t| t == kind) => {}
            _ => return Err(ValidationError::UnsupportedType(raw.kind)),
        }

        let alert = raw.alert.ok_or(ValidationError::MissingField("alert"))?;
        let flow_url = raw
            .flow_url
            .ok_or(ValidationError::MissingField("flow_url"))?;
        let flow_url = match Url::parse(&flow_url) {
            Ok(url) if url.host_str().is_some() => url,
            _ => return Err(ValidationError::InvalidFlowUrl(flow_url)),
        };

        let rule = Rule {
            sid: alert.s_id.ok_or(ValidationError::MissingField("alert.s_id"))?,
            message: alert
                .s_msg
                .ok_or(ValidationError::MissingField("alert.s_msg"))?,
            revision: alert.s_rev,
            classification: alert.s_cls,
            priority: alert.s_pr.ok_or(ValidationError::MissingField("alert.s_pr"))?,
            severity_group: alert.s_g,
            timestamp: alert.ts,
            tx_id: alert.tx_id,
            to_client: alert.to_client,
            to_server: alert.to_server,
            payload: alert.payload,
        };

        Ok(Event {
            flow_id: raw.flow_id,
            flow_url,
            ts_start: raw.ts_start,
            src: raw.src.unwrap_or_default(),
            dst: raw.dst.unwrap_or_default(),
            rule,
            proto: raw.proto,
            app_proto: raw.app_proto,
        })
    }

    /// Host (and port, when explicit) of the flow detail URL.
    ///
    /// Computed per event: two events with the same rule id but differently spelled source hosts
    /// land in different buckets.
    pub fn source_label(&self) -> String {
        source_label(&self.flow_url)
    }

    pub fn grouping_key(&self) -> GroupingKey {
        GroupingKey {
            sid: self.rule.sid,
            source_label: self.source_label(),
        }
    }
}

pub(crate) fn source_label(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Accepts ISO-8601 strings (with or without offset) and epoch numbers. Naive values are UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => parse_timestamp(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{s}'"))),
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .and_then(from_epoch)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid epoch timestamp {n}"))),
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid timestamp {other}"
        ))),
    }
}

pub(crate) fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn from_epoch(value: f64) -> Option<NaiveDateTime> {
    let millis = if value.abs() > MS_EPOCH_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    DateTime::from_timestamp_millis(millis as i64).map(|dt| dt.naive_utc())
}
