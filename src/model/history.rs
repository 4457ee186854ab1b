// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Epoch-wise population size histories and their coalescent kernels.
//!
//! Every population owns one `SizeHistory`: a single constant or
//! exponentially growing epoch, or a piecewise composition of epochs.
//! Histories expose the three Chen kernels `g`, `et`, `es`; constant
//! epochs use the closed forms from `kernels`, exponential epochs use
//! the scaled-time representation (exact for `g`, quadrature for `et`),
//! and piecewise histories compose their epochs by the Markov property.

use std::collections::HashMap;

use crate::errors::{Error, Result};
use crate::model::kernels;
use crate::utils::KahanSum;

/// Composite kernels of a piecewise history are cached under this epoch
/// tag; individual epochs use their index.
const COMPOSITE: u64 = 0xff;

fn pack(epoch: u64, i: u32, n: u32, m: u32) -> u64 {
    debug_assert!(i < 1 << 16 && n < 1 << 16 && m < 1 << 16);
    epoch << 48 | u64::from(i) << 32 | u64::from(n) << 16 | u64::from(m)
}

/// Per-history memo tables, owned by the evaluating engine and dropped
/// with it. Keys are flat packed integers.
#[derive(Default, Debug, Clone)]
pub struct KernelCache {
    g: HashMap<u64, f64>,
    et: HashMap<u64, f64>,
    es: HashMap<u64, f64>,
    // g at fixed quadrature nodes of an exponential epoch
    gq: HashMap<u64, f64>,
}

/// Resolution of the numerical integration backing `et` on exponential
/// epochs. The defaults keep the quadrature error well below the 1e-6
/// relative tolerance of the scenario tests.
#[derive(Builder, Clone, Copy, Debug, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Quadrature {
    /// number of Simpson panels across a finite epoch
    #[builder(default = "128")]
    panels: usize,
    /// scaled-time cutoff for infinite exponential epochs
    #[builder(default = "60.0")]
    scaled_horizon: f64,
}

impl Default for Quadrature {
    fn default() -> Self {
        QuadratureBuilder::default().build().unwrap()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SizeHistory {
    Constant {
        tau: f64,
        n: f64,
    },
    Exponential {
        tau: f64,
        growth_rate: f64,
        n_bottom: f64,
    },
    /// Invariant: pieces are non-piecewise and only the last may be
    /// infinite.
    Piecewise(Vec<SizeHistory>),
}

impl SizeHistory {
    pub fn constant(tau: f64, n: f64) -> Self {
        SizeHistory::Constant { tau, n }
    }

    pub fn exponential(tau: f64, growth_rate: f64, n_bottom: f64) -> Self {
        debug_assert!(growth_rate != 0.0);
        SizeHistory::Exponential {
            tau,
            growth_rate,
            n_bottom,
        }
    }

    pub fn piecewise(pieces: Vec<SizeHistory>) -> Self {
        debug_assert!(!pieces.is_empty());
        if pieces.len() == 1 {
            pieces.into_iter().next().unwrap()
        } else {
            SizeHistory::Piecewise(pieces)
        }
    }

    pub fn tau(&self) -> f64 {
        match self {
            SizeHistory::Constant { tau, .. } | SizeHistory::Exponential { tau, .. } => *tau,
            SizeHistory::Piecewise(pieces) => pieces.iter().map(|p| p.tau()).sum(),
        }
    }

    pub fn n_bottom(&self) -> f64 {
        match self {
            SizeHistory::Constant { n, .. } => *n,
            SizeHistory::Exponential { n_bottom, .. } => *n_bottom,
            SizeHistory::Piecewise(pieces) => pieces[0].n_bottom(),
        }
    }

    /// Size at the ancient end of the history:
    /// `N_top = N_bottom * exp(-growth_rate * tau)` for exponential
    /// epochs.
    pub fn n_top(&self) -> f64 {
        match self {
            SizeHistory::Constant { n, .. } => *n,
            SizeHistory::Exponential {
                tau,
                growth_rate,
                n_bottom,
            } => {
                if tau.is_infinite() {
                    if *growth_rate > 0.0 {
                        0.0
                    } else {
                        f64::INFINITY
                    }
                } else {
                    n_bottom * (-growth_rate * tau).exp()
                }
            }
            SizeHistory::Piecewise(pieces) => pieces.last().unwrap().n_top(),
        }
    }

    fn pieces(&self) -> &[SizeHistory] {
        match self {
            SizeHistory::Piecewise(pieces) => pieces,
            _ => std::slice::from_ref(self),
        }
    }

    /// A closed history must absorb all lineages: the final epoch is
    /// infinite and its size does not diverge backwards in time.
    pub(crate) fn validate_closed(&self) -> Result<()> {
        let last = self.pieces().last().unwrap();
        match last {
            SizeHistory::Constant { tau, .. } if tau.is_infinite() => Ok(()),
            SizeHistory::Exponential {
                tau, growth_rate, ..
            } if tau.is_infinite() => {
                if *growth_rate > 0.0 {
                    Ok(())
                } else {
                    Err(Error::NoCoalescence)
                }
            }
            _ => Err(Error::NoCoalescence),
        }
    }

    fn check_args(&self, n: u32, m: u32) -> Result<()> {
        if m < 1 || n < m {
            return Err(Error::KernelArguments { n, m });
        }
        Ok(())
    }

    /// Probability that `n` lineages at the bottom of this history leave
    /// exactly `m` at the top.
    pub fn g(&self, cache: &mut KernelCache, n: u32, m: u32) -> Result<f64> {
        self.check_args(n, m)?;
        let val = self.g_composite(cache, n, m);
        if !val.is_finite() {
            return Err(Error::Precision { context: "g" });
        }
        Ok(val)
    }

    /// Expected time spent with exactly `i` ancestral lineages,
    /// conditional on entering with `n` and leaving with `m`.
    pub fn et(&self, cache: &mut KernelCache, quad: &Quadrature, i: u32, n: u32, m: u32) -> Result<f64> {
        self.check_args(n, m)?;
        let val = self.et_composite(cache, quad, i, n, m);
        if !val.is_finite() {
            return Err(Error::Precision { context: "ET" });
        }
        Ok(val)
    }

    /// Expected aggregate length of branches subtending exactly `i` of
    /// the `n` bottom lineages (TPB eq. 4):
    /// `ES_i = sum_k p_{n,k}(i) k ET(k, n, m)`.
    pub fn es(&self, cache: &mut KernelCache, quad: &Quadrature, i: u32, n: u32, m: u32) -> Result<f64> {
        self.check_args(n, m)?;
        let key = pack(COMPOSITE, i, n, m);
        if let Some(&val) = cache.es.get(&key) {
            return Ok(val);
        }
        let mut acc = KahanSum::new();
        for k in m..=n {
            let p = kernels::p_n_k(i, n, k);
            if p == 0.0 {
                continue;
            }
            acc.add(p * f64::from(k) * self.et_composite(cache, quad, k, n, m));
        }
        let val = acc.sum();
        if !val.is_finite() {
            return Err(Error::Precision { context: "ES_i" });
        }
        cache.es.insert(key, val);
        Ok(val)
    }

    fn g_composite(&self, cache: &mut KernelCache, n: u32, m: u32) -> f64 {
        let key = pack(COMPOSITE, 0, n, m);
        if let Some(&val) = cache.g.get(&key) {
            return val;
        }
        let pieces = self.pieces();
        // forward pass: distribution of the lineage count after each epoch
        let mut cur = vec![0.0; n as usize + 1];
        cur[n as usize] = 1.0;
        for (e, piece) in pieces.iter().enumerate() {
            let mut next = vec![0.0; n as usize + 1];
            for j in 1..=n {
                if cur[j as usize] == 0.0 {
                    continue;
                }
                for j2 in 1..=j {
                    next[j2 as usize] += cur[j as usize] * piece.g_epoch(cache, e as u64, j, j2);
                }
            }
            cur = next;
        }
        for m2 in 1..=n {
            cache.g.insert(pack(COMPOSITE, 0, n, m2), cur[m2 as usize]);
        }
        cur[m as usize]
    }

    fn et_composite(&self, cache: &mut KernelCache, quad: &Quadrature, i: u32, n: u32, m: u32) -> f64 {
        if i < m || i > n {
            return 0.0;
        }
        let key = pack(COMPOSITE, i, n, m);
        if let Some(&val) = cache.et.get(&key) {
            return val;
        }
        let pieces = self.pieces();
        let val = if pieces.len() == 1 {
            self.et_epoch(cache, quad, 0, i, n, m)
        } else {
            let n_states = n as usize + 1;
            // forward[e][j]: P(n -> j across epochs 0..e)
            let mut forward = Vec::with_capacity(pieces.len() + 1);
            let mut first = vec![0.0; n_states];
            first[n as usize] = 1.0;
            forward.push(first);
            for (e, piece) in pieces.iter().enumerate() {
                let prev = forward.last().unwrap().clone();
                let mut next = vec![0.0; n_states];
                for j in 1..=n {
                    if prev[j as usize] == 0.0 {
                        continue;
                    }
                    for j2 in 1..=j {
                        next[j2 as usize] += prev[j as usize] * piece.g_epoch(cache, e as u64, j, j2);
                    }
                }
                forward.push(next);
            }
            // backward[e][j]: P(j -> m across epochs e..)
            let mut backward = vec![vec![0.0; n_states]; pieces.len() + 1];
            backward[pieces.len()][m as usize] = 1.0;
            for e in (0..pieces.len()).rev() {
                for j in m..=n {
                    let mut acc = 0.0;
                    for j2 in m..=j {
                        let b = backward[e + 1][j2 as usize];
                        if b == 0.0 {
                            continue;
                        }
                        acc += pieces[e].g_epoch(cache, e as u64, j, j2) * b;
                    }
                    backward[e][j as usize] = acc;
                }
            }
            let g_total = forward[pieces.len()][m as usize];
            if g_total == 0.0 {
                0.0
            } else {
                let mut acc = KahanSum::new();
                for (e, piece) in pieces.iter().enumerate() {
                    for j_in in i..=n {
                        let f = forward[e][j_in as usize];
                        if f == 0.0 {
                            continue;
                        }
                        for j_out in m..=j_in.min(i) {
                            let b = backward[e + 1][j_out as usize];
                            if b == 0.0 {
                                continue;
                            }
                            let t = piece.et_epoch(cache, quad, e as u64, i, j_in, j_out);
                            if t == 0.0 {
                                continue;
                            }
                            acc.add(f * piece.g_epoch(cache, e as u64, j_in, j_out) * t * b);
                        }
                    }
                }
                acc.sum() / g_total
            }
        };
        cache.et.insert(key, val);
        val
    }

    /// Scaled (coalescent) duration of a single epoch:
    /// `sigma = integral dt / (4 N_d(t))` with `N_d = N / 2`.
    fn sigma_total(&self) -> f64 {
        match self {
            SizeHistory::Constant { tau, n } => tau / (2.0 * n),
            SizeHistory::Exponential {
                tau,
                growth_rate,
                n_bottom,
            } => {
                if tau.is_infinite() {
                    // growth_rate > 0 enforced by validate_closed
                    f64::INFINITY
                } else {
                    (growth_rate * tau).exp_m1() / (2.0 * n_bottom * growth_rate)
                }
            }
            SizeHistory::Piecewise(_) => unreachable!("sigma of a composite history"),
        }
    }

    fn sigma_at(&self, t: f64) -> f64 {
        match self {
            SizeHistory::Constant { n, .. } => t / (2.0 * n),
            SizeHistory::Exponential {
                growth_rate,
                n_bottom,
                ..
            } => (growth_rate * t).exp_m1() / (2.0 * n_bottom * growth_rate),
            SizeHistory::Piecewise(_) => unreachable!("sigma of a composite history"),
        }
    }

    fn g_epoch(&self, cache: &mut KernelCache, epoch: u64, n: u32, m: u32) -> f64 {
        if m > n {
            return 0.0;
        }
        let key = pack(epoch, 0, n, m);
        if let Some(&val) = cache.g.get(&key) {
            return val;
        }
        let val = kernels::g_scaled(n, m, self.sigma_total());
        cache.g.insert(key, val);
        val
    }

    fn g_at_node(
        &self,
        cache: &mut KernelCache,
        epoch: u64,
        side: u64,
        node: usize,
        n: u32,
        m: u32,
        sigma: f64,
    ) -> f64 {
        let key =
            epoch << 56 | side << 55 | (node as u64) << 32 | u64::from(n) << 16 | u64::from(m);
        if let Some(&val) = cache.gq.get(&key) {
            return val;
        }
        let val = kernels::g_scaled(n, m, sigma);
        cache.gq.insert(key, val);
        val
    }

    fn et_epoch(
        &self,
        cache: &mut KernelCache,
        quad: &Quadrature,
        epoch: u64,
        i: u32,
        n: u32,
        m: u32,
    ) -> f64 {
        if i < m || i > n {
            return 0.0;
        }
        match self {
            SizeHistory::Constant { tau, n: size } => {
                let key = pack(epoch, i, n, m);
                if let Some(&val) = cache.et.get(&key) {
                    return val;
                }
                let val = kernels::et(i, n, m, size / 2.0, *tau);
                cache.et.insert(key, val);
                val
            }
            SizeHistory::Exponential { tau, .. } => {
                let key = pack(epoch, i, n, m);
                if let Some(&val) = cache.et.get(&key) {
                    return val;
                }
                let val = if n == m {
                    if i == n {
                        *tau
                    } else {
                        0.0
                    }
                } else if tau.is_infinite() {
                    if m != 1 || i == 1 {
                        0.0
                    } else {
                        self.et_exponential_infinite(cache, quad, epoch, i, n)
                    }
                } else {
                    self.et_exponential_finite(cache, quad, epoch, i, n, m)
                };
                cache.et.insert(key, val);
                val
            }
            SizeHistory::Piecewise(_) => unreachable!("et_epoch on a composite history"),
        }
    }

    // E[time at i | n -> m] over a finite exponential epoch: Simpson
    // quadrature of g(n, i, sigma(t)) g(i, m, sigma(tau) - sigma(t)),
    // normalized by g(n, m). The occupation probability factorizes like
    // this by the Markov property; only real time needs quadrature.
    fn et_exponential_finite(
        &self,
        cache: &mut KernelCache,
        quad: &Quadrature,
        epoch: u64,
        i: u32,
        n: u32,
        m: u32,
    ) -> f64 {
        let tau = self.tau();
        let g_total = self.g_epoch(cache, epoch, n, m);
        if g_total == 0.0 {
            return 0.0;
        }
        let sigma_total = self.sigma_total();
        let panels = (quad.panels().max(2) + 1) & !1;
        let h = tau / panels as f64;
        let mut acc = KahanSum::new();
        for node in 0..=panels {
            let w = if node == 0 || node == panels {
                1.0
            } else if node % 2 == 1 {
                4.0
            } else {
                2.0
            };
            let sigma = self.sigma_at(node as f64 * h);
            let below = self.g_at_node(cache, epoch, 0, node, n, i, sigma);
            if below == 0.0 {
                continue;
            }
            let above = self.g_at_node(cache, epoch, 1, node, i, m, sigma_total - sigma);
            acc.add(w * below * above);
        }
        acc.sum() * h / 3.0 / g_total
    }

    // Infinite tail with positive growth: integrate in scaled time with
    // the Jacobian dt/dsigma = 2 N_bottom / (1 + 2 N_bottom gamma sigma).
    // All mass of g(n, i, .) sits below ~40 / (i (i - 1)).
    fn et_exponential_infinite(
        &self,
        cache: &mut KernelCache,
        quad: &Quadrature,
        epoch: u64,
        i: u32,
        n: u32,
    ) -> f64 {
        let (growth_rate, n_bottom) = match self {
            SizeHistory::Exponential {
                growth_rate,
                n_bottom,
                ..
            } => (*growth_rate, *n_bottom),
            _ => unreachable!(),
        };
        let horizon = (40.0 / f64::from(i * (i - 1))).min(quad.scaled_horizon());
        let panels = (quad.panels().max(2) * 4 + 1) & !1;
        let h = horizon / panels as f64;
        let mut acc = KahanSum::new();
        for node in 0..=panels {
            let w = if node == 0 || node == panels {
                1.0
            } else if node % 2 == 1 {
                4.0
            } else {
                2.0
            };
            let sigma = node as f64 * h;
            let occupancy = self.g_at_node(cache, epoch, 0, node, n, i, sigma);
            if occupancy == 0.0 {
                continue;
            }
            let jacobian = 2.0 * n_bottom / (1.0 + 2.0 * n_bottom * growth_rate * sigma);
            acc.add(w * occupancy * jacobian);
        }
        acc.sum() * h / 3.0
    }
}
