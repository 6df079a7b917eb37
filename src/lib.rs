#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod core;
mod error;
mod executor;
mod model;
mod provider;
mod registry;
mod secret;
pub mod stacks;
mod utils;
mod value;

pub use crate::blueprint::{Blueprint, plan};
pub use crate::core::{ArcStr, Kind, Settings};
pub use crate::error::{PartialApply, PlanError, StackError, TeardownError, ValueError};
pub use crate::executor::{Deployment, Diagnostics, Execution, Exported, Stack, State};
pub use crate::model::{
    HealthProbe, MountPoint, MountSource, NetworkAttachment, PortBinding, Properties, Protocol,
    RestartPolicy, ServiceProperties, ServiceUnit, Setting,
};
pub use crate::provider::{CreateRequest, Event, MemoryProvisioner, Provisioned, Provisioner};
pub use crate::registry::{Edge, ResourceHandle};
pub use crate::secret::{
    Command, Generator, KeyFile, RandomHex, RandomPet, RandomShuffle, RandomUuid, SecretMaterial,
};
pub use crate::value::{Inputs, OutputRef, Upstream, Value, combine};

#[cfg(feature = "tokio")]
pub use crate::provider::{AsyncProvisioner, Blocking};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
