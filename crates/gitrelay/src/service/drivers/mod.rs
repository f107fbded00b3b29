//! Broker backends and the publisher cache.
//!
//! A driver row names a backend kind and carries a backend-specific JSON
//! configuration. Publishers are memoized by `(driver name, stable hash of
//! config)` and reused across events; driver writes evict every entry for
//! that driver name.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod http;
#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "nats")]
pub mod nats;
pub mod river;
pub mod sql;

use std::{
    str::FromStr,
    sync::{Arc, LazyLock},
    time::Duration,
};

use async_trait::async_trait;
use moka::future::Cache;

use crate::{
    CONFIG,
    service::{
        Envelope, RouterStore, TenantId,
        event::config_hash,
        store::{DriverFilter, StoreError},
    },
};

/// How often and how long apart publisher construction is retried.
const CONSTRUCT_RETRIES: u32 = 10;
const CONSTRUCT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// The uniform interface over one broker backend instance.
#[async_trait]
pub trait BrokerPublisher: std::fmt::Debug + Send + Sync {
    /// Backend kind name, e.g. `amqp`.
    fn name(&self) -> &'static str;

    async fn publish(&self, topic: &str, envelope: &Envelope) -> anyhow::Result<()>;

    /// Release connections. Idempotent.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Backend kinds addressable from driver rows.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DriverKind {
    Amqp,
    Nats,
    Kafka,
    Sql,
    Http,
    Gochannel,
    Riverqueue,
}

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("unknown driver kind `{0}`")]
    UnknownKind(String),
    #[error("driver kind `{0}` is not compiled into this build")]
    KindUnavailable(DriverKind),
    #[error("invalid driver config: {0}")]
    InvalidConfig(String),
    #[error("publisher construction failed: {0}")]
    Construct(anyhow::Error),
    #[error("publish failed: {0}")]
    Publish(anyhow::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no driver named `{0}` for tenant")]
    NoSuchDriver(String),
}

/// Construct a publisher for a backend kind from its config JSON, retrying
/// transient construction failures.
async fn build_publisher(
    kind: DriverKind,
    config: &serde_json::Value,
) -> Result<Arc<dyn BrokerPublisher>, PublishError> {
    let build = || async {
        match kind {
            #[cfg(feature = "amqp")]
            DriverKind::Amqp => amqp::AmqpPublisher::connect(config)
                .await
                .map(|p| Arc::new(p) as Arc<dyn BrokerPublisher>),
            #[cfg(not(feature = "amqp"))]
            DriverKind::Amqp => Err(anyhow::anyhow!("built without amqp support")),
            #[cfg(feature = "nats")]
            DriverKind::Nats => nats::NatsPublisher::connect(config)
                .await
                .map(|p| Arc::new(p) as Arc<dyn BrokerPublisher>),
            #[cfg(not(feature = "nats"))]
            DriverKind::Nats => Err(anyhow::anyhow!("built without nats support")),
            #[cfg(feature = "kafka")]
            DriverKind::Kafka => kafka::KafkaPublisher::connect(config)
                .map(|p| Arc::new(p) as Arc<dyn BrokerPublisher>),
            #[cfg(not(feature = "kafka"))]
            DriverKind::Kafka => Err(anyhow::anyhow!("built without kafka support")),
            DriverKind::Sql => sql::SqlPublisher::connect(config)
                .await
                .map(|p| Arc::new(p) as Arc<dyn BrokerPublisher>),
            DriverKind::Http => http::HttpPublisher::from_config(config)
                .map(|p| Arc::new(p) as Arc<dyn BrokerPublisher>),
            DriverKind::Gochannel => Ok(Arc::new(channel::ChannelPublisher::from_config(config))
                as Arc<dyn BrokerPublisher>),
            DriverKind::Riverqueue => river::RiverPublisher::connect(config)
                .await
                .map(|p| Arc::new(p) as Arc<dyn BrokerPublisher>),
        }
    };

    tryhard::retry_fn(build)
        .retries(CONSTRUCT_RETRIES)
        .fixed_backoff(CONSTRUCT_RETRY_DELAY)
        .await
        .map_err(PublishError::Construct)
}

type CacheKey = (String, String);

/// Shared publisher cache keyed by `(driver name, config hash)`.
static PUBLISHER_CACHE: LazyLock<Cache<CacheKey, Arc<dyn BrokerPublisher>>> =
    LazyLock::new(|| {
        Cache::builder()
            .max_capacity(1_000)
            .support_invalidation_closures()
            .async_eviction_listener(|_key, publisher: Arc<dyn BrokerPublisher>, _cause| {
                Box::pin(async move {
                    if let Err(e) = publisher.close().await {
                        tracing::debug!("Closing evicted publisher failed: {e}");
                    }
                })
            })
            .build()
    });

/// Fetch or construct the publisher for a driver config.
pub async fn publisher_for(
    driver_name: &str,
    config: &serde_json::Value,
) -> Result<Arc<dyn BrokerPublisher>, PublishError> {
    let kind = DriverKind::from_str(driver_name)
        .map_err(|_| PublishError::UnknownKind(driver_name.to_string()))?;
    let key = (driver_name.to_string(), config_hash(config));
    if let Some(publisher) = PUBLISHER_CACHE.get(&key).await {
        return Ok(publisher);
    }
    let publisher = build_publisher(kind, config).await?;
    PUBLISHER_CACHE.insert(key, publisher.clone()).await;
    Ok(publisher)
}

/// Evict every cached publisher for a driver name. Called on driver upsert
/// and delete; the old handle stays live only until eviction completes.
pub fn evict_driver(driver_name: &str) {
    let name = driver_name.to_string();
    tracing::debug!(driver = %name, "Evicting publishers for driver");
    if let Err(e) = PUBLISHER_CACHE.invalidate_entries_if(move |key, _| key.0 == name) {
        tracing::warn!("Publisher cache eviction failed: {e}");
    }
}

/// Close and drop every cached publisher.
pub async fn close_all() {
    PUBLISHER_CACHE.invalidate_all();
    PUBLISHER_CACHE.run_pending_tasks().await;
}

/// The fan-out publisher the pipeline and worker layers talk to, generic
/// over the store the driver rows live in.
#[derive(Debug, Clone)]
pub struct RouterPublisher<C: RouterStore> {
    state: C::State,
}

impl<C: RouterStore> RouterPublisher<C> {
    #[must_use]
    pub fn new(state: C::State) -> Self {
        Self { state }
    }

    /// Publish through the publisher built from an explicit driver config,
    /// the dynamic path used for rule-attached driver rows.
    pub async fn publish_dynamic(
        &self,
        driver_name: &str,
        config: &serde_json::Value,
        topic: &str,
        envelope: &Envelope,
    ) -> Result<(), PublishError> {
        let publisher = publisher_for(driver_name, config).await?;
        if CONFIG.server.debug_events {
            tracing::info!(driver = driver_name, topic = topic, envelope = %serde_json::to_string(envelope).unwrap_or_default(), "Publishing event");
        }
        publisher
            .publish(topic, envelope)
            .await
            .map_err(PublishError::Publish)
    }

    /// Publish to the listed backend names or, when the list is empty, to
    /// the configured global default list. Driver rows are resolved per
    /// tenant. Errors are returned to the caller after every listed driver
    /// was attempted.
    pub async fn publish_for_drivers(
        &self,
        tenant: &TenantId,
        topic: &str,
        envelope: &Envelope,
        drivers: &[String],
    ) -> Result<(), PublishError> {
        let names: Vec<String> = if drivers.is_empty() {
            CONFIG.publisher.default_drivers.clone()
        } else {
            drivers.to_vec()
        };
        if names.is_empty() {
            return Err(PublishError::NoSuchDriver("<default>".to_string()));
        }

        let mut first_error = None;
        for name in &names {
            let result = self
                .publish_for_named_driver(tenant, name, topic, envelope)
                .await;
            if let Err(e) = result {
                tracing::warn!(driver = %name, topic = topic, "Publish failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Publish to the default driver list.
    pub async fn publish(
        &self,
        tenant: &TenantId,
        topic: &str,
        envelope: &Envelope,
    ) -> Result<(), PublishError> {
        self.publish_for_drivers(tenant, topic, envelope, &[]).await
    }

    async fn publish_for_named_driver(
        &self,
        tenant: &TenantId,
        name: &str,
        topic: &str,
        envelope: &Envelope,
    ) -> Result<(), PublishError> {
        let row = C::list_drivers(
            tenant,
            DriverFilter::builder()
                .name(Some(name.to_string()))
                .enabled(Some(true))
                .build(),
            self.state.clone(),
        )
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| PublishError::NoSuchDriver(name.to_string()))?;
        self.publish_dynamic(&row.name, &row.config, topic, envelope)
            .await
    }

    /// Close every cached publisher handle.
    pub async fn close(&self) -> Result<(), PublishError> {
        close_all().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn driver_kind_names() {
        assert_eq!(DriverKind::from_str("amqp").unwrap(), DriverKind::Amqp);
        assert_eq!(
            DriverKind::from_str("riverqueue").unwrap(),
            DriverKind::Riverqueue
        );
        assert_eq!(
            DriverKind::from_str("GoChannel").unwrap(),
            DriverKind::Gochannel
        );
        assert!(DriverKind::from_str("pigeon").is_err());
    }

    #[tokio::test]
    async fn publisher_cache_reuses_by_config_hash() {
        let config = serde_json::json!({"capacity": 8});
        let a = publisher_for("gochannel", &config).await.unwrap();
        let b = publisher_for("gochannel", &serde_json::json!({"capacity": 8}))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = publisher_for("gochannel", &serde_json::json!({"capacity": 9}))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn eviction_drops_cached_handles() {
        let config = serde_json::json!({"capacity": 16});
        let a = publisher_for("gochannel", &config).await.unwrap();
        evict_driver("gochannel");
        PUBLISHER_CACHE.run_pending_tasks().await;
        let b = publisher_for("gochannel", &config).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let err = publisher_for("pigeon", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::UnknownKind(_)));
    }
}
