//! Version-based work routing.
//!
//! Instances carry an immutable version tag pinned at creation; workers
//! declare their own version plus a match strategy. The orchestration
//! dispatcher consults the router before executing a fetched work item.

use semver::Version;

/// Which instance tags this worker accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Instance tag must equal the worker version exactly.
    ExactMatch,
    /// Instance tag equals the worker version, or the instance is untagged.
    VersionOrUnversioned,
    /// Accept everything.
    Any,
}

/// What to do with work this worker does not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStrategy {
    /// Leave the work item undelivered (the instance stays stuck until a
    /// compatible worker runs).
    Fail,
    /// Process anyway, forfeiting the version guarantee.
    Succeed,
}

#[derive(Debug, Clone)]
pub struct VersionRouter {
    pub worker_version: Option<Version>,
    pub match_strategy: MatchStrategy,
    pub failure_strategy: FailureStrategy,
}

impl Default for VersionRouter {
    fn default() -> Self {
        Self {
            worker_version: None,
            match_strategy: MatchStrategy::Any,
            failure_strategy: FailureStrategy::Succeed,
        }
    }
}

impl VersionRouter {
    pub fn new(
        worker_version: Option<Version>,
        match_strategy: MatchStrategy,
        failure_strategy: FailureStrategy,
    ) -> Self {
        Self {
            worker_version,
            match_strategy,
            failure_strategy,
        }
    }

    /// Whether this worker accepts an instance with the given tag.
    pub fn accepts(&self, instance_tag: Option<&Version>) -> bool {
        match self.match_strategy {
            MatchStrategy::Any => true,
            MatchStrategy::ExactMatch => instance_tag == self.worker_version.as_ref(),
            MatchStrategy::VersionOrUnversioned => {
                instance_tag.is_none() || instance_tag == self.worker_version.as_ref()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn exact_match_rejects_other_versions() {
        let router = VersionRouter::new(Some(v("1.0.0")), MatchStrategy::ExactMatch, FailureStrategy::Fail);
        assert!(router.accepts(Some(&v("1.0.0"))));
        assert!(!router.accepts(Some(&v("2.0.0"))));
        assert!(!router.accepts(None));
    }

    #[test]
    fn version_or_unversioned_accepts_untagged() {
        let router = VersionRouter::new(
            Some(v("2.0.0")),
            MatchStrategy::VersionOrUnversioned,
            FailureStrategy::Fail,
        );
        assert!(router.accepts(None));
        assert!(router.accepts(Some(&v("2.0.0"))));
        assert!(!router.accepts(Some(&v("1.0.0"))));
    }

    #[test]
    fn any_accepts_everything() {
        let router = VersionRouter::default();
        assert!(router.accepts(None));
        assert!(router.accepts(Some(&v("9.9.9"))));
    }
}
