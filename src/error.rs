use thiserror::Error;

/// Why a single-image run stopped. Each stage wraps the full cause chain.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Missing tool, image, privilege or invalid configuration. Nothing was
    /// acquired yet.
    #[error("precondition not met")]
    Precondition(#[source] anyhow::Error),

    /// Loop attach, partition lookup or mount failed.
    #[error("failed to acquire system resource")]
    ResourceAcquisition(#[source] anyhow::Error),

    #[error("failed to back up the original root filesystem")]
    Backup(#[source] anyhow::Error),

    /// Format, open or mkfs failed. The working image is half-migrated.
    #[error("failed to set up the encrypted container")]
    Container(#[source] anyhow::Error),

    /// The container was created but its content is incomplete. The source
    /// image is untouched.
    #[error("failed to restore root filesystem content from {}", .staging.display())]
    Restore {
        staging: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to rewrite boot configuration")]
    BootConfig(#[source] anyhow::Error),

    #[error("interrupted")]
    Interrupted,

    #[error("output image is {actual} bytes but the source image is {expected} bytes")]
    SizeMismatch { expected: u64, actual: u64 },
}

impl PipelineError {
    /// Short category name used in batch reports.
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Precondition(_) => "precondition",
            PipelineError::ResourceAcquisition(_) => "resource-acquisition",
            PipelineError::Backup(_) => "backup",
            PipelineError::Container(_) => "container",
            PipelineError::Restore { .. } => "restore",
            PipelineError::BootConfig(_) => "boot-config",
            PipelineError::Interrupted => "interrupted",
            PipelineError::SizeMismatch { .. } => "size-mismatch",
        }
    }
}

#[cfg(test)]
pub mod tests {

    use anyhow::anyhow;

    use super::*;

    #[test]
    fn test_cause_chain_is_kept() {
        let err = anyhow::Error::from(PipelineError::Container(
            anyhow!("exit code: 2").context("Failed to format /dev/loop0p2"),
        ));
        let msg = format!("{err:#}");
        assert_eq!(
            msg,
            "failed to set up the encrypted container: Failed to format /dev/loop0p2: exit code: 2"
        );
    }

    #[test]
    fn test_category() {
        assert_eq!(PipelineError::Interrupted.category(), "interrupted");
        let err = PipelineError::Restore {
            staging: "/tmp/w/staging".into(),
            source: anyhow!("rsync failed"),
        };
        assert_eq!(err.category(), "restore");
        assert!(err.to_string().ends_with("from /tmp/w/staging"));
    }
}
