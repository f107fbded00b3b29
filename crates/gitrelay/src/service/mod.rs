pub mod authn;
pub mod credentials;
pub mod drivers;
pub mod event;
pub mod eventlog;
pub mod expr;
pub mod flatten;
pub mod health;
pub mod ingress;
pub mod rules;
pub mod store;
pub mod transform;
pub mod worker;

use std::fmt::Display;

pub use event::{Envelope, Event};
pub use store::{
    Driver, EventLogRecord, EventLogStatus, Installation, Namespace, ProviderInstance,
    RouterStore, Rule, RuleWithDriver,
};

use crate::service::{credentials::CredentialResolver, worker::WorkerHub};

/// Tenant scope carried on every request. The empty string is the global
/// scope.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize,
    serde::Deserialize, utoipa::ToSchema,
)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn global() -> Self {
        Self(String::new())
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

macro_rules! define_uuid_newtype {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
            utoipa::ToSchema,
        )]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            #[must_use]
            pub fn new(value: uuid::Uuid) -> Self {
                Self(value)
            }

            #[must_use]
            pub fn new_random() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::ops::Deref for $name {
            type Target = uuid::Uuid;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(value: uuid::Uuid) -> Self {
                Self(value)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(uuid::Uuid::parse_str(s)?))
            }
        }
    };
}

define_uuid_newtype!(RuleId);
define_uuid_newtype!(DriverId);
define_uuid_newtype!(EventLogId);

/// Source-code hosting providers handled by the ingress pipeline.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    serde::Serialize,
    serde::Deserialize,
    utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProviderKind {
    Github,
    Gitlab,
    Bitbucket,
    Slack,
}

// ---------------- State ----------------

/// Shared state handed to every handler, generic over the store backend.
#[derive(Clone, Debug)]
pub struct RouterState<C: RouterStore> {
    pub store: C::State,
    pub resolver: CredentialResolver<C>,
    pub worker_hub: WorkerHub,
}

impl<C: RouterStore> RouterState<C> {
    #[must_use]
    pub fn new(store: C::State) -> Self {
        Self {
            resolver: CredentialResolver::new(store.clone()),
            worker_hub: WorkerHub::new(),
            store,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn tenant_default_is_global() {
        assert!(TenantId::default().is_global());
        assert!(!TenantId::from("acme").is_global());
    }

    #[test]
    fn provider_kind_round_trips_lowercase() {
        assert_eq!(ProviderKind::Github.to_string(), "github");
        assert_eq!(
            ProviderKind::from_str("bitbucket").unwrap(),
            ProviderKind::Bitbucket
        );
        assert_eq!(ProviderKind::from_str("GitLab").unwrap(), ProviderKind::Gitlab);
    }
}
