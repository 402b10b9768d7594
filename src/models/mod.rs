// Domain models for managed services, images and containers

mod container;
mod decision;
mod image;
mod service;

pub use container::{ContainerConfig, ContainerDetails, ContainerState, PortBinding, RestartPolicy};
pub use decision::UpdateDecision;
pub use image::ImageVersion;
pub use service::{ServiceSpec, UpdatePolicy};
