//! Exit-code mapping.
//!
//! 0 = success, 1 = handled error, 2 = invalid invocation. Clap reports
//! its own usage errors with code 2 before we get here.

use nodupe_core::Error;

pub fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<Error>() {
        Some(Error::InvalidInput(_) | Error::PlanInvalid(_)) => 2,
        Some(_) => 1,
        // Config parse failures and other anyhow-level errors are caller
        // mistakes.
        None => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_input_is_usage_error() {
        let e = anyhow::Error::new(Error::InvalidInput("bad".into()));
        assert_eq!(exit_code(&e), 2);
    }

    #[test]
    fn handled_errors_are_one() {
        let e = anyhow::Error::new(Error::PlanConflict("x".into()));
        assert_eq!(exit_code(&e), 1);
        let e = anyhow::Error::new(Error::Drift("y".into()));
        assert_eq!(exit_code(&e), 1);
    }
}
