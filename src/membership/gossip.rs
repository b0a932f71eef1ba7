//! Dissemination helpers (Sans-IO): retransmit bound and random peer choice.

use rand::seq::SliceRandom;
use std::net::SocketAddr;

/// Number of decimal digits of `n`, i.e. `ceil(log10(n + 1))`.
fn decimal_digits(mut n: usize) -> u32 {
    let mut digits = 0;
    while n > 0 {
        digits += 1;
        n /= 10;
    }
    digits
}

/// How many times one update is retransmitted in a cluster of
/// `member_count` members: `multiplier * ceil(log10(member_count + 1))`.
pub fn retransmit_limit(multiplier: u32, member_count: usize) -> u32 {
    multiplier * decimal_digits(member_count)
}

/// Pick up to `fanout` random gossip targets from `candidates`.
///
/// `sender` is skipped unless it is the only candidate, so an update still
/// bounces back to a lone peer that may have missed a refutation.
pub fn select_gossip_targets(
    candidates: &[SocketAddr],
    sender: Option<SocketAddr>,
    fanout: usize,
) -> Vec<SocketAddr> {
    let preferred: Vec<SocketAddr> = candidates
        .iter()
        .copied()
        .filter(|addr| Some(*addr) != sender)
        .collect();

    let pool = if preferred.is_empty() {
        candidates
    } else {
        &preferred[..]
    };

    pool.choose_multiple(&mut rand::thread_rng(), fanout)
        .copied()
        .collect()
}

/// Pick one random element.
pub fn select_random<T: Clone>(candidates: &[T]) -> Option<T> {
    candidates.choose(&mut rand::thread_rng()).cloned()
}

/// Pick up to `count` random elements.
pub fn select_many<T: Clone>(candidates: &[T], count: usize) -> Vec<T> {
    candidates
        .choose_multiple(&mut rand::thread_rng(), count)
        .cloned()
        .collect()
}
