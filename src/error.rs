use thiserror::Error;

/// Failure classes that map onto the process exit codes: input parse
/// failures exit 2, a missing partition after a join exits 3, LP solver
/// failures exit 4. Anything else surfaces as a generic failure (exit 1).
#[derive(Debug, Error)]
pub enum RunError {
    #[error("input parse failure: {0}")]
    Input(String),

    #[error("missing partition output: {0}")]
    MissingPartition(String),

    #[error("LP solver failure: {0}")]
    Solver(String),
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Input(_) => 2,
            RunError::MissingPartition(_) => 3,
            RunError::Solver(_) => 4,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(RunError::Input(String::new()).exit_code(), 2);
        assert_eq!(RunError::MissingPartition(String::new()).exit_code(), 3);
        assert_eq!(RunError::Solver(String::new()).exit_code(), 4);
    }
}
