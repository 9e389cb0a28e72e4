//! Launch stages, in the order the child visits them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step of the child bootstrap sequence, and the unit of failure attribution.
///
/// The discriminant is the ordinal written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[repr(u32)]
pub enum LaunchStage {
    /// Moving the status pipe, control socket and notification descriptors into place.
    ArrangeFds = 0,
    /// Loading assignments from the environment file.
    ReadEnvFile = 1,
    /// Exporting the readiness-notification descriptor variable.
    SetNotifyFdVar = 2,
    /// Placing the activation socket on its fixed slot and exporting `LISTEN_*`.
    SetupActivationSocket = 3,
    /// Exporting the control-socket descriptor variable.
    SetupControlSocket = 4,
    /// Changing to the working directory.
    Chdir = 5,
    /// Reopening stdin/stdout/stderr and detaching from the terminal.
    SetupStdio = 6,
    /// Applying resource limits.
    SetRlimits = 7,
    /// Dropping to the target group and user.
    SetUidGid = 8,
    /// Replacing the process image.
    DoExec = 9,
}

impl LaunchStage {
    /// Every stage, in sequence order.
    pub const ALL: [Self; 10] = [
        Self::ArrangeFds,
        Self::ReadEnvFile,
        Self::SetNotifyFdVar,
        Self::SetupActivationSocket,
        Self::SetupControlSocket,
        Self::Chdir,
        Self::SetupStdio,
        Self::SetRlimits,
        Self::SetUidGid,
        Self::DoExec,
    ];

    /// Returns the wire ordinal of this stage.
    pub const fn ordinal(self) -> u32 {
        self as u32
    }

    /// Looks up a stage by wire ordinal.
    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.ordinal() == ordinal)
    }

    /// Human-readable description, phrased to follow "could not".
    pub const fn description(self) -> &'static str {
        match self {
            Self::ArrangeFds => "arrange file descriptors",
            Self::ReadEnvFile => "read environment file",
            Self::SetNotifyFdVar => "set notification fd variable",
            Self::SetupActivationSocket => "set up activation socket",
            Self::SetupControlSocket => "set up control socket",
            Self::Chdir => "change to working directory",
            Self::SetupStdio => "set up standard input/output descriptors",
            Self::SetRlimits => "set resource limits",
            Self::SetUidGid => "set user/group ID",
            Self::DoExec => "execute command",
        }
    }
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_follow_sequence_order() {
        for (i, stage) in LaunchStage::ALL.iter().enumerate() {
            assert_eq!(stage.ordinal() as usize, i);
        }
        assert!(LaunchStage::ArrangeFds < LaunchStage::DoExec);
    }

    #[test]
    fn unknown_ordinal_is_rejected() {
        assert_eq!(LaunchStage::from_ordinal(5), Some(LaunchStage::Chdir));
        assert_eq!(LaunchStage::from_ordinal(10), None);
        assert_eq!(LaunchStage::from_ordinal(u32::MAX), None);
    }
}
