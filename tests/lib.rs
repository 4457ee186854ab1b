extern crate coalspec;
#[macro_use]
extern crate approx;

use coalspec::{compute_sfs, compute_sfs_batch, Demography, Params, SiteConfig, SumProduct};

fn demography(cmd: &str) -> Demography {
    Demography::from_cmd(cmd, &Params::default()).unwrap()
}

fn sfs(demo: &Demography, derived: &[u32]) -> f64 {
    compute_sfs(demo, &SiteConfig::from_derived(demo, derived).unwrap()).unwrap()
}

/// Panmictic expectation: a constant population of diploid size N shows
/// xi_d = 2 N / d expected d-ton sites.
#[test]
fn test_panmictic_spectrum() {
    let demo = demography("-d 10000 -n 6");
    for d in 1..6 {
        assert_relative_eq!(
            sfs(&demo, &[d]),
            20_000.0 / f64::from(d),
            max_relative = 1e-6
        );
    }
}

/// Deep-precision run: n = 30 exercises the alternating Chen sums whose
/// terms overwhelm 53-bit arithmetic, but the spectrum is still exactly
/// 2 N / d.
#[test]
fn test_panmictic_spectrum_thirty_samples() {
    let demo = demography("-d 10000 -n 30");
    for &d in &[1u32, 2, 5, 15, 29] {
        assert_relative_eq!(
            sfs(&demo, &[d]),
            20_000.0 / f64::from(d),
            max_relative = 1e-8
        );
    }
}

#[test]
fn test_two_pop_split_private_singleton() {
    // One sample per deme, merging 1000 generations ago; a derived
    // allele private to deme 0 sits on a branch of expected length
    // t_split + E[T2].
    let demo = demography("-d 10000 -n 1 1 -J 1000 1 0");
    assert_relative_eq!(sfs(&demo, &[1, 0]), 11_000.0, max_relative = 1e-6);
    assert_relative_eq!(sfs(&demo, &[0, 1]), 11_000.0, max_relative = 1e-6);
}

/// Splitting at time zero is no structure at all: the structured
/// configurations partition the panmictic d-ton class hypergeometrically
/// and sum back to it.
#[test]
fn test_zero_time_split_equals_panmixia() {
    let structured = demography("-d 10000 -n 2 2 -J 0 1 0");
    let panmictic = demography("-d 10000 -n 4");
    let xi2 = sfs(&panmictic, &[2]);
    assert_relative_eq!(
        sfs(&structured, &[1, 1]),
        xi2 * 4.0 / 6.0,
        max_relative = 1e-6
    );
    let partitioned: f64 = sfs(&structured, &[2, 0])
        + sfs(&structured, &[1, 1])
        + sfs(&structured, &[0, 2]);
    assert_relative_eq!(partitioned, xi2, max_relative = 1e-6);
}

#[test]
fn test_growth_spectrum_is_finite_and_skewed() {
    // Exponential growth for 5000 generations, constant above. Growth
    // inflates the relative share of rare variants; the spectrum stays
    // positive and decreasing.
    let demo = demography("-d 10000 -n 4 -G 0 0 0.001 -N 5000 0 50000");
    let xi: Vec<f64> = (1..4).map(|d| sfs(&demo, &[d])).collect();
    for &x in &xi {
        assert!(x.is_finite() && x > 0.0);
    }
    assert!(xi[0] > xi[1] && xi[1] > xi[2]);
    // stronger singleton excess than the constant-size population
    let flat = demography("-d 10000 -n 4");
    let (f1, f2) = (sfs(&flat, &[1]), sfs(&flat, &[2]));
    assert!(xi[0] / xi[1] > f1 / f2);
}

/// Relabeling the two pulse parents while swapping the mixture
/// proportion leaves the joint SFS invariant.
#[test]
fn test_pulse_relabeling_symmetry() {
    let a = demography("-d 10000 -n 2 2 -S 500 0 0.3 -J 1000 2 1 -J 2000 1 0");
    let b = demography("-d 10000 -n 2 2 -S 500 0 0.7 -J 1000 0 1 -J 2000 1 2");
    for derived in &[[1, 0], [0, 1], [1, 1], [2, 1], [2, 2]] {
        assert_relative_eq!(
            sfs(&a, derived),
            sfs(&b, derived),
            max_relative = 1e-10
        );
    }
}

#[test]
fn test_pulse_extreme_proportion_is_continuous() {
    // With p = 1 every lineage stays and the new population is always
    // empty; the spectrum must agree with the p -> 1 limit.
    let degenerate = demography("-d 10000 -n 2 2 -S 500 0 1.0 -J 1000 2 1 -J 2000 1 0");
    let nearby = demography("-d 10000 -n 2 2 -S 500 0 0.999999999 -J 1000 2 1 -J 2000 1 0");
    for derived in &[[1, 0], [1, 1], [2, 1]] {
        assert_relative_eq!(
            sfs(&degenerate, derived),
            sfs(&nearby, derived),
            max_relative = 1e-6
        );
    }
}

/// An archaic leaf sampled at the merge time has no branch of its own:
/// configurations with no derived allele on it are unaffected, its
/// singleton class loses exactly the removed branch length.
#[test]
fn test_archaic_leaf() {
    let archaic = demography("-d 10000 -n 1 1 -a 2000 1 -J 2000 1 0");
    let contemporary = demography("-d 10000 -n 1 1 -J 2000 1 0");
    assert_relative_eq!(
        sfs(&archaic, &[1, 0]),
        sfs(&contemporary, &[1, 0]),
        max_relative = 1e-9
    );
    assert_relative_eq!(
        sfs(&archaic, &[0, 1]),
        sfs(&contemporary, &[0, 1]) - 2_000.0,
        max_relative = 1e-6
    );
}

#[test]
fn test_ms_round_trip() {
    let from_ms = Demography::from_ms(
        10_000.0,
        "-I 2 2 2 -g 1 0.02 -eg 0.025 1 0 -ej 0.05 2 1 -eN 0.05 0.5",
        &Params::default(),
    )
    .unwrap();
    let extended = demography(
        "-d 20000 -n 2 2 -G 0 0 0.000001 -G 500 0 0 -J 1000 1 0 -N 1000 * 10000",
    );
    assert_eq!(from_ms.cmd(), extended.cmd());
    for derived in &[[1, 0], [1, 1], [2, 1]] {
        assert_relative_eq!(
            sfs(&from_ms, derived),
            sfs(&extended, derived),
            max_relative = 1e-10
        );
    }
}

#[test]
fn test_engine_reuse_across_configurations() {
    // One engine evaluating many configurations (kernel caches warm)
    // must agree with fresh engines.
    let demo = demography("-d 10000 -n 3 2 -N 800 1 2000 -J 1500 1 0");
    let mut engine = SumProduct::new(&demo);
    for derived in &[[1u32, 0], [0, 1], [2, 2], [3, 1]] {
        let config = SiteConfig::from_derived(&demo, derived).unwrap();
        let warm = engine.evaluate(&config).unwrap();
        assert_relative_eq!(warm, compute_sfs(&demo, &config).unwrap());
        assert_relative_eq!(warm, engine.joint_sfs());
        assert_eq!(
            engine.n_derived_subtended_by(demo.root()),
            derived.iter().sum::<u32>()
        );
    }
}

#[test]
fn test_batch_evaluation() {
    let demo = demography("-d 10000 -n 2 2 -J 1000 1 0");
    let configs: Vec<SiteConfig> = vec![
        SiteConfig::from_derived(&demo, &[1, 0]).unwrap(),
        SiteConfig::from_derived(&demo, &[1, 1]).unwrap(),
        SiteConfig::from_derived(&demo, &[2, 2]).unwrap(),
    ];
    let batch = compute_sfs_batch(&demo, &configs).unwrap();
    assert_eq!(batch.len(), 3);
    for (config, &value) in configs.iter().zip(&batch) {
        assert!(value >= 0.0);
        assert_relative_eq!(value, compute_sfs(&demo, config).unwrap());
    }
}

#[test]
fn test_non_negativity_everywhere() {
    let demos = vec![
        demography("-d 10000 -n 3 3 -J 700 1 0"),
        demography("-d 10000 -n 2 2 -S 300 1 0.4 -J 900 2 0 -J 1600 1 0"),
        demography("-d 10000 -n 4 -G 0 0 0.0005 -N 3000 0 20000"),
    ];
    for demo in &demos {
        let sizes: Vec<u32> = demo.leaves().iter().map(|&v| demo.lineages(v)).collect();
        let mut engine = SumProduct::new(demo);
        for derived in all_configs(&sizes) {
            if derived.iter().sum::<u32>() == 0 {
                continue;
            }
            let config = SiteConfig::from_derived(demo, &derived).unwrap();
            let value = engine.evaluate(&config).unwrap();
            assert!(
                value >= 0.0 && value.is_finite(),
                "negative or non-finite sfs {} for {:?} under {}",
                value,
                derived,
                demo
            );
        }
    }
}

fn all_configs(sizes: &[u32]) -> Vec<Vec<u32>> {
    let mut ret: Vec<Vec<u32>> = vec![vec![]];
    for &n in sizes {
        ret = ret
            .into_iter()
            .flat_map(|prefix| {
                (0..=n).map(move |d| {
                    let mut next = prefix.clone();
                    next.push(d);
                    next
                })
            })
            .collect();
    }
    ret
}
