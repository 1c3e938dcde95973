// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod config;
pub mod confirmation;
pub mod error;
pub mod funding;
pub mod gateway;
pub mod metrics;
pub mod node;
pub mod pipeline;
pub mod price_oracle;
pub mod reaper;
pub mod server;
pub mod state_machine;
pub mod store;
pub mod ttl_cache;
pub mod utils;
pub mod validator;
pub mod yield_tier;

#[cfg(test)]
pub(crate) mod test_utils;

/// Polls `$func` with jittered exponential backoff until it succeeds or
/// `$max_elapsed_time` runs out, and yields the last `Result`. Errors for which
/// `$is_transient` returns false end the loop at once.
#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {
        $crate::retry_with_max_elapsed_time!($func, $max_elapsed_time, |_| true)
    };
    ($func:expr, $max_elapsed_time:expr, $is_transient:expr) => {{
        // 0.25, 0.5, 1, 2, 4, 5, 5 ... seconds, each with 10% jitter
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(250),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(5),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            std::boxed::Box::pin(async {
                match $func.await {
                    Ok(value) => Ok(value),
                    Err(e) if ($is_transient)(&e) => {
                        tracing::debug!("Retrying after transient error: {:?}", e);
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            })
        })
        .await
    }};
}
