#[path = "../support/mod.rs"]
mod support;

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use steward::entity::keys::SERVICE_STATE;
use steward::entity::{Entity, Location};
use steward::lifecycle::{
    invoke_start_all, start_each, stop_sequentially, Lifecycle, LifecycleStateMachine,
    LifecycleTracker, Startable,
};
use steward::metrics::metrics;
use steward::Error;
use support::mocks::{Journal, MockComponent};

const ALL_STATES: [Lifecycle; 6] = [
    Lifecycle::Created,
    Lifecycle::Starting,
    Lifecycle::Running,
    Lifecycle::Stopping,
    Lifecycle::Stopped,
    Lifecycle::OnFire,
];

fn any_state() -> impl Strategy<Value = Lifecycle> {
    prop::sample::select(ALL_STATES.to_vec())
}

#[test]
fn created_cannot_jump_to_running() {
    let mut machine = LifecycleStateMachine::new("app");
    let err = machine.transition(Lifecycle::Running).unwrap_err();
    assert_eq!(err.from, Lifecycle::Created);
    assert_eq!(err.to, Lifecycle::Running);
    assert_eq!(machine.state(), Lifecycle::Created);
}

#[test]
fn full_cycle_follows_documented_sequence() {
    let mut machine = LifecycleStateMachine::new("app");
    for next in [
        Lifecycle::Starting,
        Lifecycle::Running,
        Lifecycle::Stopping,
        Lifecycle::Stopped,
        Lifecycle::Starting,
        Lifecycle::OnFire,
        Lifecycle::Stopping,
        Lifecycle::Stopped,
    ] {
        machine.transition(next).unwrap();
    }
    assert_eq!(machine.state(), Lifecycle::Stopped);
}

#[test]
fn lifecycle_serialises_in_screaming_snake_case() {
    assert_eq!(
        serde_json::to_value(Lifecycle::OnFire).unwrap(),
        serde_json::json!("ON_FIRE")
    );
    assert_eq!(Lifecycle::OnFire.to_string(), "ON_FIRE");
}

#[test]
fn tracker_publishes_state_and_counts_transitions() {
    let entity = Entity::new("tracked-app");
    let tracker = LifecycleTracker::new(entity.clone());
    assert_eq!(entity.attribute(&SERVICE_STATE), Some(Lifecycle::Created));

    tracker.begin_start().unwrap();
    tracker.transition(Lifecycle::Running, "ready").unwrap();
    assert_eq!(entity.attribute(&SERVICE_STATE), Some(Lifecycle::Running));

    let counters = metrics().entity_snapshot(&entity.to_string());
    assert_eq!(counters.transitions, 2);
}

#[test]
fn stop_is_rejected_while_starting() {
    let tracker = LifecycleTracker::new(Entity::new("app"));
    tracker.begin_start().unwrap();
    assert!(matches!(tracker.begin_stop(), Err(Error::Transition(_))));
}

proptest! {
    #[test]
    fn attempted_transitions_only_follow_valid_edges(attempts in prop::collection::vec(any_state(), 1..40)) {
        let mut machine = LifecycleStateMachine::new("prop");
        let mut visited = vec![machine.state()];
        for next in attempts {
            let before = machine.state();
            match machine.transition(next) {
                Ok(previous) => {
                    prop_assert_eq!(previous, before);
                    prop_assert!(LifecycleStateMachine::is_valid_transition(before, next));
                    visited.push(next);
                }
                Err(_) => {
                    prop_assert!(!LifecycleStateMachine::is_valid_transition(before, next));
                    prop_assert_eq!(machine.state(), before);
                }
            }
        }

        // RUNNING is only ever entered straight from STARTING.
        for pair in visited.windows(2) {
            if pair[1] == Lifecycle::Running {
                prop_assert_eq!(pair[0], Lifecycle::Starting);
            }
            if pair[1] == Lifecycle::Stopped {
                prop_assert_eq!(pair[0], Lifecycle::Stopping);
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn start_each_runs_components_concurrently() {
    let journal = Journal::default();
    let components: Vec<Arc<dyn Startable>> = (0..3)
        .map(|index| {
            Arc::new(
                MockComponent::new(&format!("slow-{index}"), &journal)
                    .with_delay(Duration::from_millis(200)),
            ) as Arc<dyn Startable>
        })
        .collect();

    let started_at = std::time::Instant::now();
    let outcomes = start_each(&components, &[Location::new("rack-1")]).await;
    assert!(outcomes.iter().all(Result::is_ok));
    assert!(started_at.elapsed() < Duration::from_millis(550));
}

#[tokio::test(flavor = "multi_thread")]
async fn invoke_start_all_reports_first_failure_in_slice_order() {
    let journal = Journal::default();
    let healthy = Arc::new(MockComponent::new("healthy", &journal));
    let first = Arc::new(
        MockComponent::new("first-broken", &journal)
            .with_delay(Duration::from_millis(100))
            .failing_start("first"),
    );
    let second = Arc::new(MockComponent::new("second-broken", &journal).failing_start("second"));
    let components: Vec<Arc<dyn Startable>> =
        vec![healthy.clone(), first.clone(), second.clone()];

    let err = invoke_start_all(&components, &[]).await.unwrap_err();
    match err {
        Error::SubComponentStart { component, source } => {
            assert!(component.starts_with("first-broken"));
            assert_eq!(source.to_string(), "first");
        }
        other => panic!("unexpected error {other:?}"),
    }
    // The healthy component keeps running; nothing is rolled back.
    assert_eq!(healthy.start_count(), 1);
    assert_eq!(healthy.stop_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_sequentially_attempts_every_component() {
    let journal = Journal::default();
    let a = Arc::new(MockComponent::new("a", &journal).failing_stop("a stuck"));
    let b = Arc::new(MockComponent::new("b", &journal));
    let components: Vec<Arc<dyn Startable>> = vec![a.clone(), b.clone()];

    let err = stop_sequentially(&components).await.unwrap_err();
    assert!(matches!(err, Error::SubComponentStop { .. }));
    assert_eq!(journal.entries(), vec!["stop:a".to_string(), "stop:b".to_string()]);
    assert_eq!(b.stop_count(), 1);
}
