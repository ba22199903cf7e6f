use crate::entity::attributes::{is_ready_value, AttributeKey};
use crate::entity::Entity;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Suspends until `name` on `entity` holds a ready value and returns it.
///
/// A value is ready when it is non-null, `true` for booleans and non-empty for strings,
/// arrays and objects. The wait ends early with [`Error::Cancelled`] when `cancel` fires
/// and with [`Error::Timeout`] once `timeout` elapses.
pub async fn attribute_when_ready_raw(
    entity: &Entity,
    name: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<JsonValue> {
    let mut values = entity.attributes().watch();

    let wait = async {
        let ready = values
            .wait_for(|current| current.get(name).map(is_ready_value).unwrap_or(false))
            .await
            .map_err(|_| Error::msg(format!("attribute store of `{entity}` closed")))?;
        Ok::<_, Error>(ready.get(name).cloned().unwrap_or(JsonValue::Null))
    };

    let guarded = async {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            value = wait => value,
        }
    };

    tracing::debug!(entity = %entity, attribute = name, "waiting for attribute");
    let value = match timeout {
        Some(limit) => tokio::time::timeout(limit, guarded)
            .await
            .map_err(|_| Error::Timeout(limit))??,
        None => guarded.await?,
    };
    tracing::debug!(entity = %entity, attribute = name, "attribute ready");
    Ok(value)
}

pub async fn attribute_when_ready<T: DeserializeOwned>(
    entity: &Entity,
    key: &AttributeKey<T>,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<T> {
    let value = attribute_when_ready_raw(entity, key.name(), timeout, cancel).await?;
    Ok(serde_json::from_value(value)?)
}

/// Attributes other entities must publish before a start can complete.
///
/// Each resolved value is copied onto the starting entity under the same name. All waits
/// share one cancellation token, so an owner can abort every pending start at once.
#[derive(Clone, Default)]
pub struct StartupDependencies {
    pending: Vec<PendingAttribute>,
    cancel: CancellationToken,
}

#[derive(Clone)]
struct PendingAttribute {
    producer: Entity,
    name: String,
    timeout: Option<Duration>,
}

impl StartupDependencies {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            pending: Vec::new(),
            cancel,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn require(
        mut self,
        producer: Entity,
        name: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        self.pending.push(PendingAttribute {
            producer,
            name: name.into(),
            timeout,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Waits for every dependency in order and copies its value onto `consumer`.
    pub async fn resolve(&self, consumer: &Entity) -> Result<()> {
        for pending in &self.pending {
            let value = attribute_when_ready_raw(
                &pending.producer,
                &pending.name,
                pending.timeout,
                &self.cancel,
            )
            .await?;
            consumer.attributes().set_raw(&pending.name, value);
        }
        Ok(())
    }
}
