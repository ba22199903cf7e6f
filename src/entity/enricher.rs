use crate::entity::attributes::AttributeChange;
use crate::entity::keys::SERVICE_STATE;
use crate::entity::Entity;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Which producer attributes a [`Propagator`] copies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    Only(Vec<String>),
    /// Everything except the listed names. `service.state` is never propagated.
    AllBut(Vec<String>),
}

impl Selection {
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection::Only(names.into_iter().map(Into::into).collect())
    }

    pub fn all_but<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection::AllBut(names.into_iter().map(Into::into).collect())
    }

    pub fn includes(&self, name: &str) -> bool {
        match self {
            Selection::Only(names) => names.iter().any(|candidate| candidate == name),
            Selection::AllBut(excluded) => {
                name != SERVICE_STATE.name() && !excluded.iter().any(|candidate| candidate == name)
            }
        }
    }
}

/// Copies attributes from a producer entity onto a consumer entity as they change.
#[derive(Clone, Debug)]
pub struct Propagator {
    producer: Entity,
    consumer: Entity,
    selection: Selection,
}

impl Propagator {
    pub fn new(producer: Entity, consumer: Entity, selection: Selection) -> Self {
        Self {
            producer,
            consumer,
            selection,
        }
    }

    /// Copies the currently selected values once.
    pub fn sync(&self) {
        for (name, value) in self.producer.attributes().snapshot() {
            if self.selection.includes(&name) {
                self.consumer.attributes().set_raw(&name, value);
            }
        }
    }

    /// Subscribes to the producer, copies the values present now and keeps copying until
    /// `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut changes = self.producer.attributes().subscribe();
        self.sync();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = changes.recv() => match received {
                        Ok(AttributeChange { name, value }) => {
                            if self.selection.includes(&name) {
                                self.consumer.attributes().set_raw(&name, value);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                producer = %self.producer,
                                consumer = %self.consumer,
                                skipped,
                                "propagator lagged; resynchronising"
                            );
                            self.sync();
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}
