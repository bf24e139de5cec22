use async_trait::async_trait;
use tracing::info;

use super::{Delta, TaskId};
use crate::error::{Error, Result};
use crate::target::{argv, LocalTarget};

const CONTAINERD_NAMESPACE: &str = "k8s.io";

/// A container image present in the runtime's image store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullImage {
    /// Image reference
    pub image: String,
    /// Container runtime; only `containerd` is supported
    pub runtime: String,
}

impl PullImage {
    /// An image pulled through containerd.
    pub fn new(image: &str) -> Self {
        PullImage {
            image: image.to_string(),
            runtime: "containerd".to_string(),
        }
    }
}

#[async_trait(?Send)]
impl Delta for PullImage {
    type Actual = ();

    async fn find(&self, target: &LocalTarget) -> Result<Option<()>> {
        let filter = format!("name=={}", self.image);
        let output = target.run(&argv(&["ctr", "--namespace", CONTAINERD_NAMESPACE, "images", "check", &filter]))?;
        Ok(if output.success && output.stdout.contains(&self.image) {
            Some(())
        } else {
            None
        })
    }

    fn check_changes(&self, id: &TaskId, _actual: Option<&()>) -> Result<()> {
        if self.runtime != "containerd" {
            return Err(Error::config(format!("{}: unsupported container runtime {:?}", id, self.runtime)));
        }
        Ok(())
    }

    async fn render(&self, target: &mut LocalTarget, actual: Option<&()>) -> Result<bool> {
        if actual.is_some() {
            return Ok(false);
        }
        info!(image = %self.image, "pulling image");
        target.run_checked(&argv(&["ctr", "--namespace", CONTAINERD_NAMESPACE, "images", "pull", &self.image]))?;
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::distro::Distribution;
    use crate::target::CommandOutput;
    use crate::tasks::test::scripted_target;
    use crate::tasks::Task;

    const IMAGE: &str = "registry.k8s.io/kube-proxy:v1.29.0";

    #[tokio::test]
    async fn pulls_missing_image_once() {
        let (_dir, mut target, log) = scripted_target(Distribution::Debian12, |_| {});
        assert!(Task::from(PullImage::new(IMAGE)).apply(&mut target).await.unwrap());
        assert_eq!(
            log.lines().last().unwrap(),
            &format!("ctr --namespace k8s.io images pull {}", IMAGE)
        );

        let (_dir, mut target, log) = scripted_target(Distribution::Debian12, |r| {
            r.respond(
                &["ctr", "--namespace", "k8s.io", "images", "check"],
                CommandOutput::ok(format!("{} application/vnd.oci.image.index.v1+json complete (5/5) 28.1 MiB/28.1 MiB\n", IMAGE)),
            );
        });
        assert!(!Task::from(PullImage::new(IMAGE)).apply(&mut target).await.unwrap());
        assert_eq!(log.calls().len(), 1);
    }
}
