#![deny(warnings)]

//! This crate is the composite of environment resolution, GPU inventory,
//! and the lifecycle supervisor, packaged as the service binary.

use supervisor::Error;

/// Process exit code for a fatal supervisor error.
///
/// 0 is reserved for clean shutdown; the non-zero codes distinguish the
/// failure classes so the host can tell a misconfiguration from a crash
/// loop without parsing logs.
pub fn exit_code(err: &Error) -> i32 {
    match err {
        Error::MissingConfiguration(_) | Error::InvalidConfiguration { .. } => 2,
        Error::InsufficientResources { .. } => 3,
        Error::PortBindingFailed(_) => 4,
        Error::RetryBudgetExhausted { .. } => 5,
        Error::ChildProcessCrashed { .. } | Error::Io(_) => 1,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_failure_classes() {
        assert_eq!(exit_code(&Error::MissingConfiguration("MODEL_NAME")), 2);
        assert_eq!(
            exit_code(&Error::InvalidConfiguration {
                field: "NUM_GPUS",
                raw: "x".to_string(),
                reason: "not an integer",
            }),
            2
        );
        assert_eq!(
            exit_code(&Error::InsufficientResources {
                requested: 2,
                available: 1,
            }),
            3
        );
        assert_eq!(exit_code(&Error::PortBindingFailed(7860)), 4);
        assert_eq!(
            exit_code(&Error::RetryBudgetExhausted {
                failures: 5,
                exit_code: Some(1),
                log_tail: vec![],
            }),
            5
        );
    }
}
