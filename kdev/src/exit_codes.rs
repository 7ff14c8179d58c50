//! Stable exit codes for kdev CLI commands.

use crate::error::ProvisionError;

/// Command succeeded.
pub const OK: i32 = 0;
/// Any failure not covered by a more specific code.
pub const FAILED: i32 = 1;
/// The config file or partition layout was rejected before any side effect.
pub const INVALID_CONFIG: i32 = 2;
/// The installer console timed out or closed before an expected prompt.
pub const CONSOLE_TIMEOUT: i32 = 3;
/// An external tool (git, make, qemu-img, ...) failed or could not start.
pub const EXTERNAL_TOOL: i32 = 4;

/// Exit code for an error, from the first [`ProvisionError`] in its chain.
pub fn for_error(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ProvisionError>())
        .map_or(FAILED, for_provision_error)
}

pub fn for_provision_error(err: &ProvisionError) -> i32 {
    match err {
        ProvisionError::Config(_) => INVALID_CONFIG,
        ProvisionError::PatternTimeout { .. } | ProvisionError::ConsoleClosed { .. } => {
            CONSOLE_TIMEOUT
        }
        ProvisionError::Spawn { .. } | ProvisionError::ExternalTool { .. } => EXTERNAL_TOOL,
        ProvisionError::InvalidPattern { .. }
        | ProvisionError::Persistence { .. }
        | ProvisionError::Artifact { .. }
        | ProvisionError::Io(_) => FAILED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use std::time::Duration;

    #[test]
    fn code_comes_from_wrapped_provision_error() {
        let err = Err::<(), _>(ProvisionError::PatternTimeout {
            pattern: "login".to_string(),
            timeout: Duration::from_secs(1),
            tail: String::new(),
        })
        .context("rootfs installation failed")
        .expect_err("error");
        assert_eq!(for_error(&err), CONSOLE_TIMEOUT);
    }

    #[test]
    fn plain_errors_map_to_failed() {
        assert_eq!(for_error(&anyhow::anyhow!("boom")), FAILED);
    }

    #[test]
    fn config_errors_are_distinct() {
        let err = anyhow::Error::new(ProvisionError::Config("no root".to_string()));
        assert_eq!(for_error(&err), INVALID_CONFIG);
    }
}
