// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-client limit on authentication attempts.
//!
//! HTTP counts every `info/refs` request, which opens each fetch and push;
//! SSH counts every connection that offers a key. Clients without a known
//! address are never limited.

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use tracing::warn;

use crate::domain::access::GitAccessError;

/// Limiter state is pruned once it tracks this many clients.
const PRUNE_THRESHOLD: usize = 10_000;

pub struct AuthRateLimiter {
    limiter: Option<DefaultKeyedRateLimiter<IpAddr>>,
    per_minute: u32,
}

impl AuthRateLimiter {
    /// `0` disables the limit.
    pub fn per_minute(attempts: u32) -> Self {
        Self {
            limiter: NonZeroU32::new(attempts).map(|n| RateLimiter::keyed(Quota::per_minute(n))),
            per_minute: attempts,
        }
    }

    pub fn unlimited() -> Self {
        Self::per_minute(0)
    }

    /// Count one attempt from `peer`.
    pub fn check(&self, peer: Option<IpAddr>) -> Result<(), GitAccessError> {
        let (Some(limiter), Some(ip)) = (&self.limiter, peer) else {
            return Ok(());
        };
        if limiter.len() > PRUNE_THRESHOLD {
            limiter.retain_recent();
        }
        limiter.check_key(&ip).map_err(|_| {
            warn!("Authentication attempts from {} exceed {} per minute", ip, self.per_minute);
            metrics::counter!("localvc_auth_rate_limited_total").increment(1);
            GitAccessError::RateLimited(format!("more than {} authentication attempts per minute", self.per_minute))
        })
    }
}
