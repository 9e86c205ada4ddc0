//! Version tokens identifying evaluation rounds.

use std::fmt;

/// Version is an ordered token identifying an evaluation round.
///
/// Incremental evaluators issue `MINIMAL.next()`, then `.next()` of that, and so on, so
/// versions issued by one evaluator are strictly increasing. Non-incremental evaluators use
/// [`Version::constant`] for every round.
///
/// # Examples
///
/// ```
/// # use memo_flow::Version;
/// let v1 = Version::MINIMAL.next();
/// let v2 = v1.next();
/// assert!(v2 > v1);
/// assert!(Version::constant() > v2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Version(u64);

impl Version {
    /// The version before any round was evaluated.
    pub const MINIMAL: Version = Version(0);

    /// The fixed version used when incrementality is disabled.
    #[inline]
    pub const fn constant() -> Self {
        Version(u64::MAX)
    }

    /// Returns true if this is the constant version.
    #[inline]
    pub const fn is_constant(self) -> bool {
        self.0 == u64::MAX
    }

    /// The version following this one.
    ///
    /// The constant version is its own successor.
    #[inline]
    pub const fn next(self) -> Self {
        if self.is_constant() {
            self
        } else {
            Version(self.0 + 1)
        }
    }

    /// Get the numeric value of this version.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_constant() {
            write!(f, "v<constant>")
        } else {
            write!(f, "v{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_is_strictly_increasing() {
        let mut version = Version::MINIMAL;
        for _ in 0..10 {
            let next = version.next();
            assert!(next > version);
            version = next;
        }
        assert_eq!(version.value(), 10);
    }

    #[test]
    fn test_constant_is_fixed_point() {
        let constant = Version::constant();
        assert_eq!(constant.next(), constant);
        assert!(constant.is_constant());
        assert!(!Version::MINIMAL.is_constant());
    }

    #[test]
    fn test_display() {
        assert_eq!(Version::MINIMAL.next().to_string(), "v1");
        assert_eq!(Version::constant().to_string(), "v<constant>");
    }
}
