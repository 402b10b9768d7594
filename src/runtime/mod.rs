// Container runtime capability consumed by the checker, executor and health monitor.

mod docker;

pub use docker::DockerRuntime;

use crate::error::RuntimeError;
use crate::models::{ContainerConfig, ContainerDetails, ImageVersion};
use std::future::Future;
use std::time::Duration;

/// Operations against named containers and images. Implementations must be idempotent where the
/// engine is (starting a running container, pulling a present image).
pub trait ContainerRuntime: Send + Sync {
    /// Current image, state and extracted configuration of the container called `name`.
    fn inspect(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<ContainerDetails, RuntimeError>> + Send;

    /// Pull `image` and return the content identifier it now resolves to.
    fn pull(&self, image: &str) -> impl Future<Output = Result<ImageVersion, RuntimeError>> + Send;

    fn stop(
        &self,
        name: &str,
        grace: Duration,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn rename(
        &self,
        name: &str,
        new_name: &str,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Create and start a container `name` from `image`; returns the new container id.
    fn run(
        &self,
        image: &ImageVersion,
        name: &str,
        config: &ContainerConfig,
    ) -> impl Future<Output = Result<String, RuntimeError>> + Send;

    fn start(&self, name: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn remove(&self, name: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn remove_image(
        &self,
        image: &ImageVersion,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;
}
