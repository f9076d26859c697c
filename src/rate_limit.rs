//! Request budget calculation.
//!
//! The budget of an API is resolved in priority order:
//!
//! 1. a per-connection rate configured by the user;
//! 2. a rate read from a response header (the header name and the window it
//!    applies to are configurable);
//! 3. the global static rate (`[api] requests_per_hour`).
//!
//! From the budget the scheduler shape is derived: the pacing tick is the
//! window divided by the request count, and the worker count assumes each
//! response takes about five seconds, so enough requests can be in flight to
//! keep the pace when the server is slow.

use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::config::ApiConfig;
use crate::error::{PipelineError, Result};

const HOUR: Duration = Duration::from_secs(3600);

/// Assumed response latency used to size the worker pool.
const RESPONSE_TIME: Duration = Duration::from_secs(5);

/// A number of requests allowed within a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub requests: u64,
    pub window: Duration,
}

impl RateBudget {
    pub fn per_hour(requests: u64) -> Self {
        Self {
            requests,
            window: HOUR,
        }
    }

    /// Minimum interval between two request starts.
    pub fn tick_interval(&self) -> Result<Duration> {
        if self.requests == 0 {
            return Err(PipelineError::invalid("rate budget must allow at least one request"));
        }
        Ok(self.window / self.requests.min(u32::MAX as u64) as u32)
    }

    /// Workers needed to keep the pace when each response takes [`RESPONSE_TIME`].
    pub fn workers(&self) -> usize {
        let slots = (self.window.as_secs_f64() / RESPONSE_TIME.as_secs_f64()).max(1.0);
        ((self.requests as f64 / slots).ceil() as usize).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitCalculator {
    /// Per-connection override, requests per hour.
    pub user_rate_per_hour: Option<u64>,
    pub global_rate_per_hour: u64,
    pub header: Option<String>,
    pub header_window: Duration,
}

impl RateLimitCalculator {
    pub fn from_config(api: &ApiConfig) -> Self {
        Self {
            user_rate_per_hour: None,
            global_rate_per_hour: api.requests_per_hour,
            header: api.rate_limit_header.clone(),
            header_window: Duration::from_secs(api.rate_limit_window_secs),
        }
    }

    pub fn with_user_rate(mut self, per_hour: Option<u64>) -> Self {
        self.user_rate_per_hour = per_hour.filter(|r| *r > 0);
        self
    }

    /// Whether a sample response would be consulted.
    pub fn wants_header_sample(&self) -> bool {
        self.user_rate_per_hour.is_none() && self.header.is_some()
    }

    /// Resolve the budget. `sample` holds the headers of a response from the
    /// API, when one was fetched.
    pub fn budget(&self, sample: Option<&HeaderMap>) -> RateBudget {
        if let Some(rate) = self.user_rate_per_hour {
            return RateBudget::per_hour(rate);
        }
        if let (Some(name), Some(headers)) = (&self.header, sample) {
            let parsed = headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|r| *r > 0);
            if let Some(requests) = parsed {
                return RateBudget {
                    requests,
                    window: self.header_window,
                };
            }
        }
        RateBudget::per_hour(self.global_rate_per_hour)
    }
}
