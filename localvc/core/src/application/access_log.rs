// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! VCS access log written to the `localvc::access` tracing target, so it can
//! be routed to its own sink with an `EnvFilter` directive.

use tracing::{info, warn};

use crate::domain::access::{AccessLog, AccessLogEntry, AccessOutcome};

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAccessLog;

impl AccessLog for TracingAccessLog {
    fn record(&self, entry: &AccessLogEntry) {
        let peer = entry.peer.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
        match entry.outcome {
            AccessOutcome::Pull | AccessOutcome::Push => info!(
                target: "localvc::access",
                "{} {} {} via {} from {}",
                entry.outcome,
                entry.login,
                entry.repository,
                entry.mechanism,
                peer
            ),
            AccessOutcome::CloneFail | AccessOutcome::PushFail => warn!(
                target: "localvc::access",
                "{} {} {} via {} from {}",
                entry.outcome,
                entry.login,
                entry.repository,
                entry.mechanism,
                peer
            ),
        }
        metrics::counter!("localvc_access_log_total", "outcome" => entry.outcome.to_string()).increment(1);
    }
}
