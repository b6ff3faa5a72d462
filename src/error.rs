use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy for the fleet core. Request handlers map these onto
/// HTTP statuses; everything environment-caused lands in the 5xx range.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("identity pool exhausted")]
    PoolExhausted,

    #[error("no instance with id {0}")]
    NotFound(String),

    #[error("instance {0} is already registered")]
    DuplicateId(String),

    #[error("image {} is missing or not a regular file", .0.display())]
    ImageNotFound(PathBuf),

    #[error("failed to copy root image")]
    ImageCopyFailed(#[source] io::Error),

    #[error("failed to build cloud-init seed image: {0}")]
    CloudInitBuildFailed(String),

    #[error("network provisioning failed while {step}")]
    Provisioning {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to spawn hypervisor process")]
    ProcessSpawnFailed(#[source] io::Error),

    #[error("hypervisor refused to start the machine: {0}")]
    MachineStartFailed(String),

    #[error("hypervisor control call failed")]
    Hypervisor(#[source] anyhow::Error),

    #[error("failed to stop {} instance(s)", failures.len())]
    ShutdownFailed { failures: Vec<(String, Error)> },
}

impl Error {
    /// Stable machine-readable name, used in structured error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::PoolExhausted => "pool_exhausted",
            Error::NotFound(_) => "not_found",
            Error::DuplicateId(_) => "duplicate_id",
            Error::ImageNotFound(_) => "image_not_found",
            Error::ImageCopyFailed(_) => "image_copy_failed",
            Error::CloudInitBuildFailed(_) => "cloud_init_build_failed",
            Error::Provisioning { .. } => "provisioning_failed",
            Error::ProcessSpawnFailed(_) => "process_spawn_failed",
            Error::MachineStartFailed(_) => "machine_start_failed",
            Error::Hypervisor(_) => "hypervisor_error",
            Error::ShutdownFailed { .. } => "shutdown_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_errors_name_the_failed_step() {
        let err = Error::Provisioning {
            step: "attaching tap device to bridge",
            source: anyhow::anyhow!("ioctl failed"),
        };
        assert!(err.to_string().contains("attaching tap device to bridge"));
        assert_eq!(err.kind(), "provisioning_failed");
    }

    #[test]
    fn shutdown_failures_report_a_count() {
        let err = Error::ShutdownFailed {
            failures: vec![("a".into(), Error::PoolExhausted)],
        };
        assert!(err.to_string().contains("1 instance(s)"));
    }
}
