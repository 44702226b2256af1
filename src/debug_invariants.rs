use crate::mesh_error::CdMeshError;

/// Trait for validating data structure invariants.
pub trait DebugInvariants {
    /// Assert invariants in debug builds or when invariant checking is enabled.
    fn debug_assert_invariants(&self);
    /// Validate invariants and return the first violation encountered.
    fn validate_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Description of a failed invariant check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct InvariantViolation(pub String);

impl From<CdMeshError> for InvariantViolation {
    fn from(e: CdMeshError) -> Self {
        InvariantViolation(e.to_string())
    }
}

/// Helper macro to run a fallible check and panic on error when invariant
/// checking is enabled.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}

/// Fatal assertion for topology corruption.
///
/// Decomposition cannot continue once a node, subelement or side violates its
/// structural contract, so the message is logged and the process aborts via
/// `panic!` in every build profile.
#[macro_export]
macro_rules! cdfem_require {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            let msg = format!($($arg)+);
            log::error!("{}", msg);
            panic!("{}", msg);
        }
    };
}
