//! Resource limits: configuration syntax and application in the child.

use std::fmt;

use libc::rlim_t;
use nix::sys::resource::Resource;

use crate::sys::Sys;

/// Value meaning "no limit".
pub const UNLIMITED: rlim_t = libc::RLIM_INFINITY;

/// A soft/hard limit pair as read from or written to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Rlimit {
    /// Current (soft) limit.
    pub soft: rlim_t,
    /// Ceiling (hard) limit.
    pub hard: rlim_t,
}

impl Rlimit {
    /// A soft/hard pair.
    pub const fn new(soft: rlim_t, hard: rlim_t) -> Self {
        Self { soft, hard }
    }
}

/// One configured limit. An unset side keeps its current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ResourceLimit {
    /// The limited resource.
    pub resource: Resource,
    /// New soft limit, if set.
    pub soft: Option<rlim_t>,
    /// New hard limit, if set.
    pub hard: Option<rlim_t>,
}

impl ResourceLimit {
    /// A limit that sets both sides.
    pub const fn both(resource: Resource, soft: rlim_t, hard: rlim_t) -> Self {
        Self {
            resource,
            soft: Some(soft),
            hard: Some(hard),
        }
    }

    /// Parses a limit value.
    ///
    /// | Syntax | Soft      | Hard      |
    /// |--------|-----------|-----------|
    /// | `S:H`  | S         | H         |
    /// | `S:`   | S         | unchanged |
    /// | `:H`   | unchanged | H         |
    /// | `S`    | S         | S         |
    ///
    /// `-` in either position means unlimited. Numbers may be decimal, or
    /// hexadecimal with a `0x` prefix.
    pub fn parse(resource: Resource, value: &str) -> Result<Self, LimitParseError> {
        if value.is_empty() {
            return Err(LimitParseError::Empty);
        }
        let Some((soft, hard)) = value.split_once(':') else {
            let both = parse_value(value)?;
            return Ok(Self::both(resource, both, both));
        };
        Ok(Self {
            resource,
            soft: parse_side(soft)?,
            hard: parse_side(hard)?,
        })
    }

    /// Returns `true` if applying this limit requires reading the current one.
    pub const fn needs_current(&self) -> bool {
        self.soft.is_none() || self.hard.is_none()
    }

    /// Overlays the configured sides onto `current`.
    pub fn overlay(&self, current: Rlimit) -> Rlimit {
        Rlimit {
            soft: self.soft.unwrap_or(current.soft),
            hard: self.hard.unwrap_or(current.hard),
        }
    }
}

/// Parses an optional side: empty means unset.
fn parse_side(s: &str) -> Result<Option<rlim_t>, LimitParseError> {
    if s.is_empty() {
        Ok(None)
    } else {
        parse_value(s).map(Some)
    }
}

/// Parses a single number or `-`.
fn parse_value(s: &str) -> Result<rlim_t, LimitParseError> {
    if s == "-" {
        return Ok(UNLIMITED);
    }
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(LimitParseError::Invalid(s.to_owned()));
    }
    rlim_t::from_str_radix(digits, radix).map_err(|_| LimitParseError::TooLarge(s.to_owned()))
}

/// Error parsing a limit value.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LimitParseError {
    /// The value was empty.
    Empty,
    /// A side was neither a number nor `-`.
    Invalid(String),
    /// A number does not fit the platform's limit type.
    TooLarge(String),
}

impl fmt::Display for LimitParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty limit value"),
            Self::Invalid(s) => write!(f, "bad limit value '{s}'"),
            Self::TooLarge(s) => write!(f, "limit value '{s}' is too large"),
        }
    }
}

impl std::error::Error for LimitParseError {}

/// Looks up a resource by its configuration name.
pub fn resource_by_name(name: &str) -> Option<Resource> {
    Some(match name {
        "nofile" => Resource::RLIMIT_NOFILE,
        "core" => Resource::RLIMIT_CORE,
        "data" => Resource::RLIMIT_DATA,
        "addrspace" | "as" => Resource::RLIMIT_AS,
        "stack" => Resource::RLIMIT_STACK,
        "cpu" => Resource::RLIMIT_CPU,
        "fsize" => Resource::RLIMIT_FSIZE,
        "nproc" => Resource::RLIMIT_NPROC,
        "memlock" => Resource::RLIMIT_MEMLOCK,
        _ => return None,
    })
}

/// Applies `limits` in order. The first read or write failure stops it.
pub fn apply<S: Sys + ?Sized>(sys: &mut S, limits: &[ResourceLimit]) -> nix::Result<()> {
    for limit in limits {
        let current = if limit.needs_current() {
            sys.getrlimit(limit.resource)?
        } else {
            Rlimit { soft: 0, hard: 0 }
        };
        sys.setrlimit(limit.resource, limit.overlay(current))?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use nix::errno::Errno;

    use super::*;
    use crate::fake::{Call, FakeSys, Op};

    const NOFILE: Resource = Resource::RLIMIT_NOFILE;

    #[test]
    fn parses_all_forms() {
        assert_eq!(
            ResourceLimit::parse(NOFILE, "4:5").unwrap(),
            ResourceLimit::both(NOFILE, 4, 5)
        );
        assert_eq!(
            ResourceLimit::parse(NOFILE, "4").unwrap(),
            ResourceLimit::both(NOFILE, 4, 4)
        );
        let soft_only = ResourceLimit::parse(NOFILE, "4:").unwrap();
        assert_eq!((soft_only.soft, soft_only.hard), (Some(4), None));
        let hard_only = ResourceLimit::parse(NOFILE, ":0x10").unwrap();
        assert_eq!((hard_only.soft, hard_only.hard), (None, Some(16)));
        let unlimited = ResourceLimit::parse(NOFILE, "1024:-").unwrap();
        assert_eq!(unlimited.hard, Some(UNLIMITED));
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(ResourceLimit::parse(NOFILE, ""), Err(LimitParseError::Empty));
        assert!(matches!(
            ResourceLimit::parse(NOFILE, "4:x"),
            Err(LimitParseError::Invalid(_))
        ));
        assert!(matches!(
            ResourceLimit::parse(NOFILE, "-5"),
            Err(LimitParseError::Invalid(_))
        ));
        assert!(matches!(
            ResourceLimit::parse(NOFILE, "99999999999999999999999"),
            Err(LimitParseError::TooLarge(_))
        ));
    }

    #[test]
    fn hard_only_keeps_current_soft() {
        let mut sys = FakeSys::new();
        sys.set_rlimit(NOFILE, Rlimit { soft: 1024, hard: 4096 });

        let limits = [
            ResourceLimit::parse(NOFILE, ":8192").unwrap(),
            ResourceLimit::parse(NOFILE, ":16384").unwrap(),
        ];
        apply(&mut sys, &limits).unwrap();

        assert_eq!(sys.rlimit(NOFILE), Rlimit { soft: 1024, hard: 16384 });
        let reads = sys
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Getrlimit(_)))
            .count();
        assert_eq!(reads, 2);
    }

    #[test]
    fn fully_specified_limit_skips_read() {
        let mut sys = FakeSys::new();
        apply(&mut sys, &[ResourceLimit::both(NOFILE, 10, 20)]).unwrap();
        assert!(!sys.calls().iter().any(|c| matches!(c, Call::Getrlimit(_))));
        assert_eq!(sys.rlimit(NOFILE), Rlimit { soft: 10, hard: 20 });
    }

    #[test]
    fn read_failure_stops_before_apply() {
        let mut sys = FakeSys::new();
        sys.fail_next(Op::Getrlimit, Errno::EINVAL);
        let err = apply(&mut sys, &[ResourceLimit::parse(NOFILE, "8:").unwrap()]);
        assert_eq!(err, Err(Errno::EINVAL));
        assert!(!sys.calls().iter().any(|c| matches!(c, Call::Setrlimit(..))));
    }

    #[test]
    fn names_map_to_resources() {
        assert_eq!(resource_by_name("as"), Some(Resource::RLIMIT_AS));
        assert_eq!(resource_by_name("addrspace"), Some(Resource::RLIMIT_AS));
        assert_eq!(resource_by_name("bogus"), None);
    }
}
