//! Resolver state definitions.

/// Resolver operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    /// Resolver is constructed but not yet started.
    Starting,
    /// Resolver is running and accepting work.
    Running,
    /// Resolver is shutting down, not accepting new work.
    ShuttingDown,
    /// Resolver is stopped.
    Stopped,
}

impl ResolverState {
    /// Check if the resolver is accepting new work.
    pub fn accepts_work(&self) -> bool {
        matches!(self, ResolverState::Running)
    }

    /// Check if the resolver is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResolverState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_running_accepts_work() {
        assert!(ResolverState::Running.accepts_work());
        for state in [
            ResolverState::Starting,
            ResolverState::ShuttingDown,
            ResolverState::Stopped,
        ] {
            assert!(!state.accepts_work());
        }
        assert!(ResolverState::Stopped.is_terminal());
    }
}
