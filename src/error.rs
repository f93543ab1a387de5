//! Error types for configuration validation and decoding.

/// Fatal configuration problems, reported before any model is loaded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// At least one objective (the primary loss) is required.
    #[error("no objectives configured; `losses` must name at least the primary loss")]
    NoObjectives,
    /// A per-objective (or per-constraint) option list has the wrong length.
    #[error("`{option}` has {found} entries, expected {expected}")]
    CountMismatch {
        option: &'static str,
        expected: usize,
        found: usize,
    },
    /// Selection weights must form a convex combination.
    #[error("betas sum to {0}, expected 1.0")]
    BetaSum(f64),
    /// `weighted_sum` selection needs explicit weights.
    #[error("selection criterion `weighted_sum` requires `betas`")]
    MissingBetas,
    /// Constraints exist but no thresholds were given for them.
    #[error("{0} constraint(s) configured but no `epsilons` given")]
    MissingEpsilons(usize),
    #[error("unknown selection criterion {0:?} (expected primary_allsat or weighted_sum)")]
    UnknownSelection(String),
    #[error("unknown sampling strategy {0:?} (expected greedy, topk or topp)")]
    UnknownSampling(String),
    #[error("unknown target type {0:?} (expected simplex or probs)")]
    UnknownTarget(String),
    #[error("unknown init policy {0:?} (expected zeros, random, source or target)")]
    UnknownInit(String),
    #[error("unknown optimizer {0:?} (expected sgd, adam or expgd)")]
    UnknownOptimizer(String),
    #[error("unknown epsilon decay function {0:?} (expected none, linear, step or cosine)")]
    UnknownDecay(String),
    #[error("unknown precision {0:?} (expected full or half)")]
    UnknownPrecision(String),
    /// Exponentiated gradient needs probability rows, not logits.
    #[error("optimizer {optimizer:?} cannot update {target:?} targets (use adam or sgd)")]
    IncompatibleOptimizer { optimizer: String, target: String },
    /// A single option holds an out-of-range value.
    #[error("invalid `{option}`: {reason}")]
    Invalid { option: &'static str, reason: String },
}

/// Errors surfaced by the decoding driver.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Scoring models disagree on vocabulary size and the override is off.
    #[error(
        "scoring models must share a vocabulary: {primary} (primary) != {other} ({model}); \
         pass allow_diff_vocab to proceed anyway"
    )]
    VocabMismatch {
        primary: usize,
        other: usize,
        model: String,
    },
    /// The three dataset streams are not line-aligned.
    #[error("dataset streams are misaligned: {source_lines} source, {target_lines} target, {additional_lines} additional lines")]
    MisalignedData {
        source_lines: usize,
        target_lines: usize,
        additional_lines: usize,
    },
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used across the decoding core.
pub type Result<T, E = DecodeError> = std::result::Result<T, E>;
