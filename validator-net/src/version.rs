//! Application versions and peer compatibility.
//!
//! Versions are advertised as `"<app>/<major>.<minor>.<patch>"`. A peer is
//! compatible when it runs the same application at or above the minimum
//! compatible version. The minimum can be raised at a scheduled upgrade
//! time: until then the previous minimum still applies, and peers that only
//! satisfy the previous minimum are reported as [`VersionCheck::Deprecated`].

use {
    serde::{Deserialize, Serialize},
    std::{cmp::Ordering, fmt, str::FromStr, time::SystemTime},
};

/// Application name advertised by this node.
pub const APPLICATION_NAME: &str = "trv1";

/// A semantic application version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub app: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn new(app: impl Into<String>, major: u32, minor: u32, patch: u32) -> Self {
        Self {
            app: app.into(),
            major,
            minor,
            patch,
        }
    }

    /// Compare the numeric triple, ignoring the application name.
    pub fn cmp_numbers(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }

    pub fn before(&self, other: &Self) -> bool {
        self.cmp_numbers(other) == Ordering::Less
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}.{}", self.app, self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (app, numbers) = s
            .split_once('/')
            .ok_or_else(|| format!("missing application separator in {s:?}"))?;
        if app.is_empty() {
            return Err(format!("empty application name in {s:?}"));
        }
        let mut parts = numbers.split('.');
        let mut next = |name: &str| -> Result<u32, String> {
            parts
                .next()
                .ok_or_else(|| format!("missing {name} in {s:?}"))?
                .parse()
                .map_err(|e| format!("bad {name} in {s:?}: {e}"))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        if parts.next().is_some() {
            return Err(format!("trailing components in {s:?}"));
        }
        Ok(Self::new(app, major, minor, patch))
    }
}

/// Outcome of a compatibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// The peer satisfies the current minimum.
    Compatible,
    /// The peer only satisfies the pre-upgrade minimum; it is tolerated
    /// until the upgrade time passes.
    Deprecated,
    /// The peer must not be connected.
    Incompatible,
}

impl VersionCheck {
    /// Whether the connection may proceed.
    pub fn is_accepted(self) -> bool {
        !matches!(self, Self::Incompatible)
    }
}

/// Compare `remote` against `local` and `min_compatible`.
///
/// Fails closed: a different application, or anything strictly below
/// `min_compatible`, is incompatible.
pub fn check(local: &Version, remote: &Version, min_compatible: &Version) -> VersionCheck {
    if remote.app != local.app || remote.before(min_compatible) {
        VersionCheck::Incompatible
    } else {
        VersionCheck::Compatible
    }
}

/// Version policy of the local node.
#[derive(Debug, Clone)]
pub struct Compatibility {
    current: Version,
    min_compatible: Version,
    upgrade_time: SystemTime,
    prev_min_compatible: Version,
}

impl Compatibility {
    /// A policy whose minimum never changes.
    pub fn new(current: Version, min_compatible: Version) -> Self {
        Self {
            prev_min_compatible: min_compatible.clone(),
            current,
            min_compatible,
            upgrade_time: SystemTime::UNIX_EPOCH,
        }
    }

    /// A policy that raises the minimum from `prev_min_compatible` to
    /// `min_compatible` at `upgrade_time`.
    pub fn with_upgrade(
        current: Version,
        min_compatible: Version,
        upgrade_time: SystemTime,
        prev_min_compatible: Version,
    ) -> Self {
        Self {
            current,
            min_compatible,
            upgrade_time,
            prev_min_compatible,
        }
    }

    pub fn current(&self) -> &Version {
        &self.current
    }

    pub fn check(&self, remote: &Version) -> VersionCheck {
        self.check_at(remote, SystemTime::now())
    }

    pub fn check_at(&self, remote: &Version, now: SystemTime) -> VersionCheck {
        let enforced = if now >= self.upgrade_time {
            &self.min_compatible
        } else {
            &self.prev_min_compatible
        };
        match check(&self.current, remote, enforced) {
            VersionCheck::Compatible if remote.before(&self.min_compatible) => {
                VersionCheck::Deprecated
            }
            outcome => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    fn v(major: u32, minor: u32, patch: u32) -> Version {
        Version::new(APPLICATION_NAME, major, minor, patch)
    }

    #[test]
    fn test_parse_and_display() {
        let version: Version = "trv1/1.2.3".parse().unwrap();
        assert_eq!(version, v(1, 2, 3));
        assert_eq!(version.to_string(), "trv1/1.2.3");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "trv1", "/1.2.3", "trv1/1.2", "trv1/1.2.3.4", "trv1/a.b.c"] {
            assert!(bad.parse::<Version>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_check_fails_closed() {
        let local = v(1, 4, 0);
        let min = v(1, 2, 0);
        assert_eq!(check(&local, &v(1, 2, 0), &min), VersionCheck::Compatible);
        assert_eq!(check(&local, &v(2, 0, 0), &min), VersionCheck::Compatible);
        assert_eq!(check(&local, &v(1, 1, 9), &min), VersionCheck::Incompatible);
        let other_app = Version::new("other", 9, 9, 9);
        assert_eq!(check(&local, &other_app, &min), VersionCheck::Incompatible);
    }

    #[test]
    fn test_upgrade_time_switches_minimum() {
        let upgrade = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let compat = Compatibility::with_upgrade(v(1, 5, 0), v(1, 4, 0), upgrade, v(1, 3, 0));
        let before = upgrade - Duration::from_secs(1);

        assert_eq!(compat.check_at(&v(1, 4, 0), before), VersionCheck::Compatible);
        assert_eq!(compat.check_at(&v(1, 3, 5), before), VersionCheck::Deprecated);
        assert_eq!(compat.check_at(&v(1, 2, 9), before), VersionCheck::Incompatible);

        assert_eq!(compat.check_at(&v(1, 4, 0), upgrade), VersionCheck::Compatible);
        assert_eq!(compat.check_at(&v(1, 3, 5), upgrade), VersionCheck::Incompatible);
    }

    #[test]
    fn test_deprecated_is_accepted() {
        assert!(VersionCheck::Compatible.is_accepted());
        assert!(VersionCheck::Deprecated.is_accepted());
        assert!(!VersionCheck::Incompatible.is_accepted());
    }
}
