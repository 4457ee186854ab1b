// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Closed-form coalescent kernels from Hua Chen (2012), Theoretical
//! Population Biology: the probability `g(n, m)` that `n` lineages
//! coalesce down to `m` over an epoch, and the expected time `ET(i, n, m)`
//! spent with exactly `i` ancestral lineages, conditional on the epoch's
//! endpoints. `N` always denotes the diploid population size, so any
//! pair of lineages coalesces at rate `1 / (2N)`.
//!
//! The `g` coefficients form an alternating series whose terms dwarf the
//! result by many orders of magnitude; everything up to the final ratio
//! is therefore evaluated in `rug` (MPFR) big-floats with at least 100
//! bits of mantissa.

use std::sync::atomic::{AtomicU32, Ordering};

use bio::stats::LogProb;
use rug::{Float, Integer};
use statrs::function::factorial::ln_binomial;

static PRECISION_BITS: AtomicU32 = AtomicU32::new(100);

/// Set the mantissa precision (in bits) used by all coalescent kernels.
/// Intended to be called once at process start; values below 100 bits
/// are known to lose the alternating `g` sums to cancellation.
pub fn set_precision(bits: u32) {
    PRECISION_BITS.store(bits.max(53), Ordering::Relaxed);
}

/// The current kernel mantissa precision in bits.
pub fn precision() -> u32 {
    PRECISION_BITS.load(Ordering::Relaxed)
}

fn big(x: f64) -> Float {
    Float::with_val(precision(), x)
}

fn big_int(x: &Integer) -> Float {
    Float::with_val(precision(), x)
}

/// Rising factorial `n (n+1) ... (n+k-1)` as an exact integer.
pub(crate) fn rising(n: u64, k: u64) -> Integer {
    let mut acc = Integer::from(1u32);
    for j in n..n + k {
        acc *= j;
    }
    acc
}

/// Falling factorial `n (n-1) ... (n-k+1)` as an exact integer.
pub(crate) fn falling(n: u64, k: u64) -> Integer {
    debug_assert!(k <= n);
    let mut acc = Integer::from(1u32);
    for j in n - k + 1..=n {
        acc *= j;
    }
    acc
}

pub(crate) fn factorial(n: u64) -> Integer {
    Integer::from(Integer::factorial(n as u32))
}

/// Exact binomial coefficient; zero outside the triangle.
pub(crate) fn binom_exact(n: i64, k: i64) -> Integer {
    if k < 0 || n < 0 || k > n {
        return Integer::from(0u32);
    }
    falling(n as u64, k as u64) / factorial(k as u64)
}

/// `log C(n, k)` via log-gamma.
pub(crate) fn logbinom(n: u64, k: u64) -> f64 {
    ln_binomial(n, k)
}

/// Log probability that a parent carrying `n_p_der` derived and
/// `n_p_anc` ancestral lineages, once its lineage set is expanded to a
/// child with `n_c_der`/`n_c_anc`, produced exactly that child split.
/// This is the exchangeable (hypergeometric-in-label) urn weight used to
/// distribute derived alleles over surviving lineages.
pub(crate) fn log_urn_prob(n_p_der: u32, n_p_anc: u32, n_c_der: u32, n_c_anc: u32) -> LogProb {
    let n_parent = n_p_der + n_p_anc;
    let n_child = n_c_der + n_c_anc;
    if n_c_der >= n_p_der && n_p_der > 0 && n_c_anc >= n_p_anc && n_p_anc > 0 {
        LogProb(
            logbinom(u64::from(n_c_der) - 1, u64::from(n_p_der) - 1)
                + logbinom(u64::from(n_c_anc) - 1, u64::from(n_p_anc) - 1)
                - logbinom(u64::from(n_child) - 1, u64::from(n_parent) - 1),
        )
    } else if (n_c_der == 0 && n_p_der == 0) || (n_c_anc == 0 && n_p_anc == 0) {
        LogProb::ln_one()
    } else {
        LogProb::ln_zero()
    }
}

/// Tavaré/Chen series coefficient
/// `(2k-1) (-1)^(k-m) rising(m, k-1) falling(n, k) / (m! (k-m)! rising(n, k))`,
/// as an exact integer ratio rounded once into a big-float.
fn gcoef(k: u32, n: u32, m: u32) -> Float {
    debug_assert!(m <= k && k <= n);
    let mut num = rising(u64::from(m), u64::from(k) - 1) * falling(u64::from(n), u64::from(k));
    num *= 2 * u64::from(k) - 1;
    if (k - m) % 2 == 1 {
        num = -num;
    }
    let den = factorial(u64::from(m))
        * factorial(u64::from(k - m))
        * rising(u64::from(n), u64::from(k));
    big_int(&num) / big_int(&den)
}

fn exp_c(k: u32, sigma: f64) -> Float {
    big(-f64::from(k * (k - 1)) * sigma).exp()
}

/// `g(n, m)` over an epoch of scaled duration `sigma = tau / (4N)`: the
/// probability that `n` lineages at the bottom leave exactly `m` at the
/// top. After rescaling time by `1 / (4N(t))` the lineage count is a
/// time-homogeneous pure death process, so this is exact for growing
/// epochs as well.
pub(crate) fn g_scaled_big(n: u32, m: u32, sigma: f64) -> Float {
    debug_assert!(m >= 1 && m <= n);
    if sigma.is_infinite() {
        return big(if m == 1 { 1.0 } else { 0.0 });
    }
    let mut sum = big(0.0);
    for k in m..=n {
        sum += gcoef(k, n, m) * exp_c(k, sigma);
    }
    sum
}

pub(crate) fn g_scaled(n: u32, m: u32, sigma: f64) -> f64 {
    g_scaled_big(n, m, sigma).to_f64()
}

/// `g(n, m, N, tau)` with real time and a constant diploid size.
pub fn g(n: u32, m: u32, n_diploid: f64, tau: f64) -> f64 {
    g_scaled(n, m, tau / (4.0 * n_diploid))
}

// ET, all lineage counts equal at both ends: formula 1 of Chen's eq. 3,
// the time spent with exactly `m = i` lineages.
fn formula1(n: u32, m: u32, sigma: f64) -> Float {
    let mut r = big(0.0);
    for k in m + 1..=n {
        let denom = f64::from((k - m) * (k + m - 1));
        let bracket = (exp_c(m, sigma) - exp_c(k, sigma)) / denom - exp_c(m, sigma) * sigma;
        r += gcoef(k, n, m) * bracket;
    }
    r
}

// Formula 2: the time spent with all `i = n` starting lineages.
fn formula2(n: u32, m: u32, sigma: f64) -> Float {
    let mut r = big(0.0);
    for k in m..n {
        let denom = f64::from((n - k) * (n + k - 1));
        let bracket = (exp_c(k, sigma) - exp_c(n, sigma)) / denom - exp_c(n, sigma) * sigma;
        r += gcoef(k, n, m) * bracket;
    }
    r
}

// Formula 3 (Chen's eq. 4): time spent at an interior lineage count
// `m < j < n`. The three summands keep their derivation signs; `l < j < k`
// makes some denominators negative and they must stay that way.
fn formula3(j: u32, n: u32, m: u32, sigma: f64) -> Float {
    let mut r = big(0.0);
    for k in j + 1..=n {
        let kj = i64::from(k - j) * i64::from(k + j - 1);
        let mut inner = big(0.0);
        for l in m..j {
            let lj = i64::from(l) - i64::from(j);
            let lj = lj * (i64::from(l) + i64::from(j) - 1);
            let lk = i64::from(l) - i64::from(k);
            let lk = lk * (i64::from(l) + i64::from(k) - 1);
            let a = exp_c(j, sigma) * (big(sigma) - (kj + lj) as f64 / (kj * lj) as f64);
            let b = exp_c(k, sigma) * (lj as f64 / (kj * lk) as f64);
            let c = exp_c(l, sigma) * (kj as f64 / (lk * lj) as f64);
            inner += gcoef(l, j, m) * (a + b - c);
        }
        r += gcoef(k, n, j) * inner;
    }
    r
}

/// Expected time during an epoch of duration `tau` with exactly `i`
/// ancestral lineages, starting from `n` at the bottom and conditional
/// on `m` remaining at the top. A conditional expectation: the endpoint
/// probability `g(n, m)` is divided out. Impossible endpoints
/// (`g(n, m) = 0`, e.g. a zero-length epoch with `m < n`) contribute
/// nothing and yield 0.
pub fn et(i: u32, n: u32, m: u32, n_diploid: f64, tau: f64) -> f64 {
    debug_assert!(n >= m && m >= 1);
    if i < m || i > n {
        return 0.0;
    }
    if tau.is_infinite() {
        if m != 1 || i == 1 {
            return 0.0;
        }
        return 4.0 * n_diploid / f64::from(i * (i - 1));
    }
    if n == m {
        return if i == n { tau } else { 0.0 };
    }
    if tau == 0.0 {
        // m < n is unreachable over a zero-length epoch; without this
        // shortcut the result would be a ratio of two rounding residuals
        return 0.0;
    }
    let sigma = tau / (4.0 * n_diploid);
    let g_big = g_scaled_big(n, m, sigma);
    if g_big.is_zero() {
        return 0.0;
    }
    let r = if m == i {
        formula1(n, m, sigma)
    } else if n == i {
        formula2(n, m, sigma)
    } else {
        formula3(i, n, m, sigma)
    };
    (big(4.0 * n_diploid) * r / g_big).to_f64()
}

/// Probability that, while `k` ancestral lineages are present, a given
/// one of them subtends exactly `i` of the `n` bottom lineages.
pub(crate) fn p_n_k(i: u32, n: u32, k: u32) -> f64 {
    if k == 1 {
        return if i == n { 1.0 } else { 0.0 };
    }
    let num = binom_exact(i64::from(n) - i64::from(i) - 1, i64::from(k) - 2);
    let den = binom_exact(i64::from(n) - 1, i64::from(k) - 1);
    num.to_f64() / den.to_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_g_two_lineages_closed_form() {
        // g(2, 1) = 1 - exp(-tau / (2N)).
        let (n_diploid, tau): (f64, f64) = (5_000.0, 8_000.0);
        let expected = 1.0 - (-tau / (2.0 * n_diploid)).exp();
        assert_relative_eq!(g(2, 1, n_diploid, tau), expected, epsilon = 1e-12);
        assert_relative_eq!(g(2, 2, n_diploid, tau), 1.0 - expected, epsilon = 1e-12);
    }

    #[test]
    fn test_g_is_a_distribution() {
        for &(n, sigma) in &[(4u32, 0.3), (10, 0.05), (17, 1.2)] {
            let total: f64 = (1..=n).map(|m| g_scaled(n, m, sigma)).sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_g_degenerate_epochs() {
        assert_relative_eq!(g(7, 7, 1e4, 0.0), 1.0, epsilon = 1e-12);
        for m in 1..7 {
            assert_relative_eq!(g(7, m, 1e4, 0.0), 0.0, epsilon = 1e-12);
        }
        assert_relative_eq!(g(7, 1, 1e4, f64::INFINITY), 1.0);
        assert_relative_eq!(g(7, 3, 1e4, f64::INFINITY), 0.0);
    }

    #[test]
    fn test_g_deep_precision() {
        // n = 30 with a short epoch: the alternating terms overwhelm the
        // result in 53-bit arithmetic. The row must still sum to one and
        // each entry must be a probability.
        let sigma = 0.01 / f64::from(30 * 29);
        let total: f64 = (1..=30u32).map(|m| g_scaled(30, m, sigma)).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        for m in 1..=30u32 {
            let val = g_scaled(30, m, sigma);
            assert!(val >= -1e-12 && val <= 1.0 + 1e-12, "g(30, {}) = {}", m, val);
        }
        // Long epoch: 30 lineages all but surely find their MRCA.
        assert!(g_scaled(30, 1, 5.0) > 0.999);
        assert!(g_scaled(30, 1, 5.0) <= 1.0 + 1e-12);
    }

    #[test]
    fn test_et_two_lineages_closed_forms() {
        let (n_diploid, tau): (f64, f64) = (5_000.0, 7_500.0);
        let lambda = 1.0 / (2.0 * n_diploid);
        let p_coal = 1.0 - (-lambda * tau).exp();
        // E[T2 | T2 < tau] and its complement within the epoch.
        let e_t2 = 1.0 / lambda - tau * (-lambda * tau).exp() / p_coal;
        assert_relative_eq!(et(2, 2, 1, n_diploid, tau), e_t2, epsilon = 1e-8);
        assert_relative_eq!(et(1, 2, 1, n_diploid, tau), tau - e_t2, epsilon = 1e-8);
        // Conditional on no coalescence the whole epoch is spent at 2.
        assert_relative_eq!(et(2, 2, 2, n_diploid, tau), tau, epsilon = 1e-12);
    }

    #[test]
    fn test_et_partitions_the_epoch() {
        // Conditional occupation times must add up to the epoch length,
        // whatever the endpoints. Exercises formulas 1, 2 and 3.
        let (n_diploid, tau) = (10_000.0, 12_345.0);
        for &(n, m) in &[(6u32, 2u32), (5, 1), (8, 8), (9, 4)] {
            let total: f64 = (m..=n).map(|i| et(i, n, m, n_diploid, tau)).sum();
            assert_relative_eq!(total, tau, epsilon = 1e-6, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_et_infinite_epoch() {
        let n_diploid = 10_000.0;
        assert_relative_eq!(
            et(2, 2, 1, n_diploid, f64::INFINITY),
            2.0 * n_diploid,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            et(3, 5, 1, n_diploid, f64::INFINITY),
            4.0 * n_diploid / 6.0,
            epsilon = 1e-9
        );
        assert_relative_eq!(et(1, 5, 1, n_diploid, f64::INFINITY), 0.0);
        assert_relative_eq!(et(3, 5, 2, n_diploid, f64::INFINITY), 0.0);
    }

    #[test]
    fn test_et_impossible_endpoint_is_zero() {
        assert_relative_eq!(et(2, 4, 2, 1e4, 0.0), 0.0);
    }

    #[test]
    fn test_p_n_k() {
        // With two branches over four bottom lineages, the (3, 1) split
        // happens with probability C(0, 0) / C(3, 1) per branch.
        assert_relative_eq!(p_n_k(3, 4, 2), 1.0 / 3.0);
        assert_relative_eq!(p_n_k(4, 4, 1), 1.0);
        assert_relative_eq!(p_n_k(2, 4, 1), 0.0);
        assert_relative_eq!(p_n_k(4, 4, 2), 0.0);
        // For fixed k the subtended-class sizes are a distribution in i.
        let total: f64 = (1..=4).map(|i| p_n_k(i, 4, 2)).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_urn_prob() {
        // Parent 1+1 lineages expanding to 2+1: the two derived children
        // either share the derived parent or not.
        let p = log_urn_prob(1, 1, 2, 1).exp();
        assert_relative_eq!(p, 0.5, epsilon = 1e-12);
        assert_relative_eq!(log_urn_prob(0, 2, 0, 5).exp(), 1.0);
        assert_relative_eq!(log_urn_prob(2, 0, 6, 0).exp(), 1.0);
        assert_relative_eq!(log_urn_prob(2, 1, 1, 4).exp(), 0.0);
    }

    #[test]
    fn test_exact_combinatorics() {
        assert_eq!(rising(3, 4), Integer::from(3 * 4 * 5 * 6));
        assert_eq!(falling(6, 3), Integer::from(6 * 5 * 4));
        assert_eq!(rising(5, 0), Integer::from(1));
        assert_eq!(binom_exact(10, 3), Integer::from(120));
        assert_eq!(binom_exact(3, 7), Integer::from(0));
        assert_eq!(binom_exact(-1, 2), Integer::from(0));
    }
}
