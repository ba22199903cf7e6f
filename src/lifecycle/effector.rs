use crate::entity::Location;
use crate::error::{Error, Result};
use crate::lifecycle::Startable;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

/// Starts every component concurrently and returns each outcome, in slice order, once
/// all of them have finished.
pub async fn start_each(
    components: &[Arc<dyn Startable>],
    locations: &[Location],
) -> Vec<Result<()>> {
    let mut tasks = JoinSet::new();
    for (index, component) in components.iter().enumerate() {
        let component = Arc::clone(component);
        let locations = locations.to_vec();
        tasks.spawn(async move { (index, component.start(&locations).await) });
    }

    let mut outcomes: Vec<Option<Result<()>>> = components.iter().map(|_| None).collect();
    let mut aborted = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, outcome)) => outcomes[index] = Some(outcome),
            Err(err) => {
                aborted.get_or_insert_with(|| err.to_string());
            }
        }
    }

    outcomes
        .into_iter()
        .map(|outcome| {
            outcome.unwrap_or_else(|| {
                Err(Error::msg(format!(
                    "start task aborted: {}",
                    aborted.as_deref().unwrap_or("unknown")
                )))
            })
        })
        .collect()
}

/// Starts every component concurrently and waits for all of them.
///
/// When several starts fail the first failure in slice order is reported, wrapped as
/// [`Error::SubComponentStart`]. Components that started successfully stay started.
pub async fn invoke_start_all(
    components: &[Arc<dyn Startable>],
    locations: &[Location],
) -> Result<()> {
    let started_at = Instant::now();
    let outcomes = start_each(components, locations).await;
    let duration_ms = started_at.elapsed().as_millis() as u64;

    for (component, outcome) in components.iter().zip(outcomes) {
        if let Err(failure) = outcome {
            tracing::error!(
                entity = %component.entity(),
                error = %failure,
                duration_ms,
                "sub-component start failed"
            );
            return Err(Error::start_failed(component.entity().to_string(), failure));
        }
    }

    tracing::debug!(components = components.len(), duration_ms, "sub-components started");
    Ok(())
}

/// Stops components one at a time in slice order.
///
/// A failing stop does not prevent the remaining components from being stopped; the first
/// failure is returned once all have been attempted.
pub async fn stop_sequentially(components: &[Arc<dyn Startable>]) -> Result<()> {
    let mut first_failure = None;
    for component in components {
        if let Err(err) = component.stop().await {
            tracing::error!(
                entity = %component.entity(),
                error = %err,
                "sub-component stop failed"
            );
            first_failure
                .get_or_insert_with(|| Error::stop_failed(component.entity().to_string(), err));
        }
    }

    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
