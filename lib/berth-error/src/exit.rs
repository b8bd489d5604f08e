use std::process::ExitCode;

/// How a berth invocation ended, as seen by the calling shell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    /// Every requested operation completed.
    Success,

    /// The topology or its configuration was rejected, or some other fatal error occurred before or outside of
    /// activation (image build failures, an unreachable container runtime, and so on).
    Fatal,

    /// Activation ran, but at least one service never became ready.
    ReadinessFailure,
}

impl ExitStatus {
    /// Numeric process exit code.
    pub const fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Fatal => 1,
            Self::ReadinessFailure => 2,
        }
    }

    /// Combines two statuses, keeping the more severe one.
    pub fn merge(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    fn severity(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::ReadinessFailure => 1,
            Self::Fatal => 2,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}
