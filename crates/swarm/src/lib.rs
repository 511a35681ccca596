//! Typed facade over the container orchestrator (Docker Swarm).
//!
//! [`Orchestrator`] is the seam the rest of the workspace talks to. Two
//! implementations ship here:
//!
//! - [`DockerSwarm`] drives the `docker` CLI against a swarm manager and, for
//!   container-level details, against the daemon of the node running a task.
//! - [`InMemorySwarm`] keeps everything in memory and lets tests script task
//!   scheduling, vanishing services and unreachable nodes.

pub mod docker;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod types;

pub use {
    docker::DockerSwarm,
    error::{Error, Result},
    memory::InMemorySwarm,
    orchestrator::Orchestrator,
    types::{
        ContainerHandle, LabelFilter, Mount, MountKind, NodeInfo, PortBinding, PublishMode,
        Resources, ServiceHandle, ServiceSpec, TaskInfo, TaskState, Workload,
    },
};
