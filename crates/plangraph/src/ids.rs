//! Strongly typed identifiers
//!
//! Every entity in a build is keyed by a random UUID. The newtypes keep a
//! `TeamId` from being handed to something that expects a `ProvisionedHostId`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_type!(
    /// Identifier of a [`crate::Build`]
    BuildId
);
id_type!(
    /// Identifier of a [`crate::Team`]
    TeamId
);
id_type!(
    /// Identifier of a [`crate::ProvisionedNetwork`]
    ProvisionedNetworkId
);
id_type!(
    /// Identifier of a [`crate::ProvisionedHost`]; doubles as the agent client id
    ProvisionedHostId
);
id_type!(
    /// Identifier of a [`crate::ProvisioningStep`]
    ProvisioningStepId
);
id_type!(
    /// Identifier of a plan node
    PlanId
);
id_type!(
    /// Identifier of a [`crate::BuildCommit`]
    CommitId
);
id_type!(
    /// Identifier of an agent task dispatched for an ExecuteStep node
    TaskId
);
