// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error};

use crate::config::TelegramConfig;
use crate::delivery::Transport;
use crate::errors::TransportError;
use crate::http_utils::build_client;

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

/// Sends digests through the Telegram Bot API `sendMessage` method.
pub struct TelegramTransport {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig) -> Self {
        let client = build_client(
            config.https_proxy.as_deref(),
            Duration::from_secs(config.timeout_secs),
        )
        .unwrap_or_else(|e| {
            error!(
                "Unable to parse proxy configuration: {}, no proxy will be used",
                e
            );
            reqwest::Client::new()
        });
        TelegramTransport {
            client,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_url.trim_end_matches('/'),
                config.bot_token
            ),
            chat_id: config.chat_id.clone(),
        }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(&self, text: &str) -> Result<(), TransportError> {
        let payload = SendMessage {
            chat_id: &self.chat_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };
        let response = self.client.post(&self.endpoint).json(&payload).send().await?;
        let status = response.status();
        if status.is_success() {
            debug!("Telegram accepted message ({} bytes)", text.len());
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status { status, body })
    }
}
