use std::process::ExitCode;

use crate::Error;

pub fn exit_code(err: &Error) -> ExitCode {
    match err {
        Error::CreateDir { .. } => ExitCode::from(73),
        Error::ReadConfig { .. } => ExitCode::from(74),
        Error::ParseConfig { .. } => ExitCode::from(65),
        Error::InvalidConfig { .. } => ExitCode::from(65),
        Error::ExplicitConfigMissing { .. } => ExitCode::from(66),
        Error::Validation { .. } => ExitCode::from(65),
        Error::UnknownRange { .. } => ExitCode::from(66),
        Error::Resource { .. } => ExitCode::from(70),
        Error::Transport { .. } => ExitCode::from(70),
        Error::Hypervisor { .. } => ExitCode::from(70),
        Error::TaskFailed { .. } => ExitCode::from(70),
        Error::Timeout { .. } => ExitCode::from(70),
        Error::Integrity { .. } => ExitCode::from(70),
        Error::WriteState { .. } => ExitCode::from(74),
        Error::ReadState { .. } => ExitCode::from(74),
        Error::EncodeState { .. } => ExitCode::from(74),
        Error::StateRootLocked { .. } => ExitCode::from(75),
        Error::PreflightFailed { .. } => ExitCode::from(70),
        Error::Internal { .. } => ExitCode::from(70),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn exit_code_matches_expected_values() {
        assert_eq!(
            exit_code(&Error::Validation {
                message: "bad ref".into()
            }),
            ExitCode::from(65)
        );
        assert_eq!(
            exit_code(&Error::UnknownRange { range: "r1".into() }),
            ExitCode::from(66)
        );
        assert_eq!(
            exit_code(&Error::StateRootLocked {
                path: "state".into()
            }),
            ExitCode::from(75)
        );
        assert_eq!(
            exit_code(&Error::ReadState {
                path: "registry.json".into(),
                source: io::Error::other("err")
            }),
            ExitCode::from(74)
        );
        assert_eq!(
            exit_code(&Error::PreflightFailed {
                message: "fail".into()
            }),
            ExitCode::from(70)
        );
    }
}
