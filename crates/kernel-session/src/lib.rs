//! kernel-session - Kernel session provisioning and execution lifecycle.
//!
//! A [`Provisioner`] obtains a kernel service (local processes, an in-process
//! lite loader, or a remote Jupyter server) and optionally starts or attaches
//! to a kernel. The resulting [`Kernel`] handle tracks connection state,
//! survives restarts, and hands out a [`KernelExecutor`] per code execution.
//! Each executor drives a one-shot phase machine and accumulates outputs,
//! mirroring everything into a shared [`StateStore`].

pub mod config;
pub mod error;
pub mod executor;
pub mod kernel;
pub mod local;
pub mod message;
pub mod mock;
pub mod outputs;
pub mod phase;
pub mod provisioner;
pub mod reconnect;
pub mod service;
pub mod status;
pub mod store;

pub use config::SessionSettings;
pub use error::{KernelSessionError, Result};
pub use executor::{ExecuteOptions, ExecutionOutcome, KernelExecutor, MessageHook};
pub use kernel::{Kernel, KernelEvent, KernelIdentity, KernelOptions};
pub use local::local_services;
pub use message::{Channel, KernelMessage, MessageContent};
pub use outputs::{OutputAccumulator, OutputRecord};
pub use phase::{ExecutionPhase, PhaseTracker};
pub use provisioner::{ProvisionConfig, Provisioned, Provisioner};
pub use reconnect::{FileReconnectionStore, MemoryReconnectionStore, ReconnectionStore};
pub use service::{KernelConnection, ServiceManager};
pub use status::{ConnectionState, ConnectionStatus, ExecutionStatus};
pub use store::StateStore;
