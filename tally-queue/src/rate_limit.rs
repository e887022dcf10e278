// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Throttling for hot-path log lines.

use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};

#[doc(hidden)]
pub fn millis_since_process_epoch() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let elapsed: Duration = Instant::now().duration_since(*EPOCH.get_or_init(Instant::now));
    elapsed.as_millis().try_into().unwrap_or(u64::MAX)
}

/// `rate_limited!(interval, expr)` evaluates `expr` at most once per `interval` across all threads.
///
/// Each call site has its own limit. Used for warnings on paths that can fire per event, such as
/// dropped events or failing storage, so the first occurrence is logged and then one line per
/// interval while the problem persists.
#[macro_export]
macro_rules! rate_limited {
    ($interval:expr, $call:expr) => {{
        use ::std::sync::atomic::{AtomicU64, Ordering};
        static NEXT_CALL: AtomicU64 = AtomicU64::new(0);
        let interval: ::std::time::Duration = $interval;
        let now = $crate::rate_limit::millis_since_process_epoch();
        let next = NEXT_CALL.load(Ordering::Relaxed);
        if next <= now {
            let interval_ms: u64 = interval.as_millis().try_into().unwrap_or(u64::MAX);
            if NEXT_CALL
                .compare_exchange(
                    next,
                    now.saturating_add(interval_ms.max(1)),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                $call;
            }
        }
    }};
}
