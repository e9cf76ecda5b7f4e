// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod config;
pub mod delivery;
pub mod digest;
pub mod errors;
pub mod event;
pub mod filter;
pub mod flusher;
pub mod http_utils;
pub mod ingest;
pub mod queue;
pub mod server;
pub mod stats;
pub mod telegram;
pub mod tls;
