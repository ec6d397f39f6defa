//! Process-wide counters. Lock-free and free of clocks, addresses and printing
//! (enforced by `build.rs`), so any code path can record without side effects.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::trust_state::TrustState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Ok,
    Degraded,
    Faulted,
}

#[cfg(feature = "obs_none")]
pub const ENABLED: bool = false;

#[cfg(not(feature = "obs_none"))]
pub const ENABLED: bool = true;

static SIGNED_RESPONSES: AtomicU64 = AtomicU64::new(0);
static PASSTHROUGH_RESPONSES: AtomicU64 = AtomicU64::new(0);
static SIGN_FAILURES: AtomicU64 = AtomicU64::new(0);
static UPSTREAM_FAILURES: AtomicU64 = AtomicU64::new(0);
static HEALTH_STATE: AtomicU64 = AtomicU64::new(0);

const VERDICT_KINDS: usize = 7;
static VERDICTS: [AtomicU64; VERDICT_KINDS] = [const { AtomicU64::new(0) }; VERDICT_KINDS];

#[inline]
fn bump(counter: &AtomicU64) {
    if ENABLED {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline]
pub fn record_signed() {
    bump(&SIGNED_RESPONSES);
}

#[inline]
pub fn record_passthrough() {
    bump(&PASSTHROUGH_RESPONSES);
}

#[inline]
pub fn record_sign_failure() {
    bump(&SIGN_FAILURES);
    set_health(HealthState::Degraded);
}

#[inline]
pub fn record_upstream_failure() {
    bump(&UPSTREAM_FAILURES);
}

#[inline]
pub fn record_verdict(state: TrustState) {
    bump(&VERDICTS[verdict_index(state)]);
}

const fn verdict_index(state: TrustState) -> usize {
    match state {
        TrustState::Unknown => 0,
        TrustState::DohFailure => 1,
        TrustState::IgnoredDomain => 2,
        TrustState::IgnoredResource => 3,
        TrustState::Trusted => 4,
        TrustState::TrustedPartial => 5,
        TrustState::Untrusted => 6,
    }
}

#[inline]
pub fn set_health(state: HealthState) {
    HEALTH_STATE.store(state as u64, Ordering::Relaxed);
}

#[inline]
pub fn get_health() -> HealthState {
    match HEALTH_STATE.load(Ordering::Relaxed) {
        0 => HealthState::Ok,
        1 => HealthState::Degraded,
        _ => HealthState::Faulted,
    }
}

#[derive(Debug, Clone)]
pub struct ObservabilitySnapshot {
    pub signed_responses: u64,
    pub passthrough_responses: u64,
    pub sign_failures: u64,
    pub upstream_failures: u64,
    pub verdicts: [u64; VERDICT_KINDS],
}

impl ObservabilitySnapshot {
    pub fn verdicts_for(&self, state: TrustState) -> u64 {
        self.verdicts[verdict_index(state)]
    }
}

pub fn snapshot() -> ObservabilitySnapshot {
    ObservabilitySnapshot {
        signed_responses: SIGNED_RESPONSES.load(Ordering::Relaxed),
        passthrough_responses: PASSTHROUGH_RESPONSES.load(Ordering::Relaxed),
        sign_failures: SIGN_FAILURES.load(Ordering::Relaxed),
        upstream_failures: UPSTREAM_FAILURES.load(Ordering::Relaxed),
        verdicts: VERDICTS.each_ref().map(|c| c.load(Ordering::Relaxed)),
    }
}

#[cfg(all(test, not(feature = "obs_none")))]
mod tests {
    use super::*;

    // Counters are global and other tests bump them concurrently, so only
    // monotonic growth is asserted.
    #[test]
    fn test_counters_grow() {
        let before = snapshot();
        record_signed();
        record_verdict(TrustState::Untrusted);
        let after = snapshot();

        assert!(after.signed_responses > before.signed_responses);
        assert!(after.verdicts_for(TrustState::Untrusted) > before.verdicts_for(TrustState::Untrusted));
    }
}
