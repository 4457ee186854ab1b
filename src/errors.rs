use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("demography string must begin with -d followed by -n")]
    MissingPreamble,
    #[error("invalid flag -{flag} in demography string")]
    InvalidFlag { flag: String },
    #[error("flag -{flag} expects {expected} arguments, got {got}")]
    InvalidFlagArity {
        flag: String,
        expected: usize,
        got: usize,
    },
    #[error("substitution variable ${name} is not defined")]
    UnknownVariable { name: String },
    #[error("invalid numeric literal {literal:?} in demography string")]
    InvalidLiteral { literal: String },
    #[error("-a must precede all demographic events (-G, -N, -J, -S)")]
    ArchaicAfterEvent,
    #[error("event at {t} generations refers to unknown or extinct population {pop}")]
    UnknownPopulation { pop: String, t: f64 },
    #[error("negative time or population size in population {pop} (were events specified in the correct order?)")]
    EventOutOfOrder { pop: usize },
    #[error("pulse probability {p} is not within [0, 1]")]
    InvalidPulseProbability { p: f64 },
    #[error("demography must have a single root population, found {n}")]
    MultipleRoots { n: usize },
    #[error("root size history does not guarantee coalescence (infinite final epoch with nonpositive growth rate)")]
    NoCoalescence,
    #[error("ms command line must begin with -I")]
    MissingMsPreamble,
    #[error("continuous migration is not implemented (flag -{flag})")]
    MigrationNotImplemented { flag: String },
    #[error("coalescent kernel called with n = {n} < m = {m}")]
    KernelArguments { n: u32, m: u32 },
    #[error("configuration has {got} entries but the demography has {expected} leaf populations")]
    ConfigLength { expected: usize, got: usize },
    #[error("configuration counts {ancestral} + {derived} exceed the {lineages} lineages sampled in leaf {leaf}")]
    ConfigExceedsSample {
        leaf: usize,
        ancestral: u32,
        derived: u32,
        lineages: u32,
    },
    #[error("configuration contains no derived allele; site configurations must be polymorphic")]
    ConfigNoDerived,
    #[error("non-finite value in {context}; increase the big-float precision or check the demography for degenerate parameters")]
    Precision { context: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
