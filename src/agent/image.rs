use std::{
    io::Write,
    path::{Path, PathBuf},
};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    utils::id::short_id,
};

#[derive(Debug, Clone)]
pub struct ImageAgentConfig {
    pub image_dir: PathBuf,
    pub cloud_localds_binary: PathBuf,
}

/// Materializes per-instance disk state: a private scratch copy of the
/// template root image and, when requested, a cloud-init seed image.
pub struct ImageAgent {
    config: ImageAgentConfig,
}

impl ImageAgent {
    pub async fn new(config: ImageAgentConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.image_dir).await?;
        Ok(Self { config })
    }

    /// Copies the template into a private scratch image the instance may
    /// write to freely.
    pub async fn prepare(&self, template: &Path, identity: u8) -> Result<PathBuf> {
        let metadata = tokio::fs::metadata(template)
            .await
            .map_err(|_| Error::ImageNotFound(template.to_path_buf()))?;
        if !metadata.is_file() {
            return Err(Error::ImageNotFound(template.to_path_buf()));
        }

        let scratch = self
            .config
            .image_dir
            .join(format!("rootfs-{identity}-{}.img", short_id()));

        tokio::fs::copy(template, &scratch)
            .await
            .map_err(Error::ImageCopyFailed)?;

        debug!("copied {} to {}", template.display(), scratch.display());
        Ok(scratch)
    }

    /// Builds a cloud-init seed image from the caller's user-data, with a
    /// per-instance metadata document so concurrent creates cannot collide.
    pub async fn prepare_cloud_init(
        &self,
        user_data: &Path,
        instance_id: &str,
        identity: u8,
    ) -> Result<PathBuf> {
        let mut meta_data = tempfile::NamedTempFile::new()
            .map_err(|err| Error::CloudInitBuildFailed(err.to_string()))?;
        meta_data
            .write_all(format!("instance-id: {instance_id}\n").as_bytes())
            .map_err(|err| Error::CloudInitBuildFailed(err.to_string()))?;

        let iso = self.config.image_dir.join(format!("seed-{identity}.iso"));

        let output = Command::new(&self.config.cloud_localds_binary)
            .arg(&iso)
            .arg(user_data)
            .arg(meta_data.path())
            .output()
            .await
            .map_err(|err| Error::CloudInitBuildFailed(err.to_string()))?;

        if !output.status.success() {
            return Err(Error::CloudInitBuildFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(iso)
    }

    /// Best-effort deletion; the instance is already gone, so failures are
    /// only logged.
    pub async fn cleanup(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("removed {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove {}: {}", path.display(), err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_agent(dir: &Path) -> ImageAgent {
        ImageAgent::new(ImageAgentConfig {
            image_dir: dir.to_path_buf(),
            cloud_localds_binary: PathBuf::from("cloud-localds"),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_prepare_copies_template() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;

        let template = dir.path().join("base.img");
        tokio::fs::write(&template, b"rootfs-bytes").await.unwrap();

        let scratch = agent.prepare(&template, 6).await.unwrap();
        assert_ne!(scratch, template);
        assert_eq!(tokio::fs::read(&scratch).await.unwrap(), b"rootfs-bytes");
    }

    #[tokio::test]
    async fn test_prepare_rejects_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;

        let err = agent
            .prepare(&dir.path().join("nope.img"), 6)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn test_prepare_rejects_non_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;

        let err = agent.prepare(dir.path(), 6).await.unwrap_err();
        assert!(matches!(err, Error::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn test_cleanup_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;

        let scratch = dir.path().join("rootfs-6.img");
        tokio::fs::write(&scratch, b"x").await.unwrap();

        agent.cleanup(&scratch).await;
        assert!(!scratch.exists());

        agent.cleanup(&scratch).await;
    }

    #[tokio::test]
    async fn test_cloud_init_build_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ImageAgent::new(ImageAgentConfig {
            image_dir: dir.path().to_path_buf(),
            cloud_localds_binary: dir.path().join("no-such-binary"),
        })
        .await
        .unwrap();

        let user_data = dir.path().join("user-data.yml");
        tokio::fs::write(&user_data, b"#cloud-config\n").await.unwrap();

        let err = agent
            .prepare_cloud_init(&user_data, "some-id", 6)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CloudInitBuildFailed(_)));
    }
}
