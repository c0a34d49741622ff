// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`.
//! `JSONL` can be enabled by setting the `DYN_LOGGING_JSONL` environment variable
//! to `1`. Filters are read from the `DYN_LOG` environment variable using the
//! `EnvFilter` directive syntax, e.g. `DYN_LOG=dynamo_collectives=debug`.

use std::sync::Once;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// ENV used to set the log level
const FILTER_ENV: &str = "DYN_LOG";

/// ENV used to switch to JSON lines output
const JSONL_ENV: &str = "DYN_LOGGING_JSONL";

static INIT: Once = Once::new();

/// Initialize the logger
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter_layer = filters();
    let result = if env_is_truthy(JSONL_ENV) {
        let l = fmt::layer()
            .with_ansi(false)
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).try_init()
    } else {
        let l = fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).try_init()
    };

    // Another subscriber (e.g. from the embedding application) wins.
    if let Err(e) = result {
        tracing::debug!("logging already initialized: {e}");
    }
}

fn filters() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(FILTER_ENV)
        .from_env_lossy()
}

fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        tracing::info!(component = "collectives", "logging initialized");
    }

    #[test]
    fn test_env_is_truthy() {
        temp_env::with_var("DYN_COLLECTIVES_TEST_FLAG", Some("On"), || {
            assert!(env_is_truthy("DYN_COLLECTIVES_TEST_FLAG"));
        });
        temp_env::with_var("DYN_COLLECTIVES_TEST_FLAG", Some("0"), || {
            assert!(!env_is_truthy("DYN_COLLECTIVES_TEST_FLAG"));
        });
        temp_env::with_var_unset("DYN_COLLECTIVES_TEST_FLAG", || {
            assert!(!env_is_truthy("DYN_COLLECTIVES_TEST_FLAG"));
        });
    }
}
