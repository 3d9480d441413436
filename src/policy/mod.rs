//! Proxyless selection policy
//!
//! Decides per destination whether a direct, packet-manipulated dial is
//! worth trying, and falls back to the proxy chain when it is not or when
//! it fails.

mod dialer;
mod history;

pub use dialer::{config_fingerprint, FallbackDialer, ProxylessDialer};
pub use history::{AttemptHistory, AttemptReason, AttemptRecord, Outcome, DEFAULT_STALENESS};
