#[path = "../common/mod.rs"]
mod common;
#[path = "../support/mod.rs"]
mod support;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use steward::cluster::DynamicCluster;
use steward::entity::keys::{GROUP_SIZE, HOST_AND_PORT, ROOT_URL, SERVICE_STATE, SERVICE_UP};
use steward::entity::{Entity, Group, Location};
use steward::lifecycle::{Lifecycle, Startable};
use steward::orchestrator::{CompositeOrchestrator, ControlledCluster, Requirement, Tier};
use steward::pool::{AddressSelectorConfig, ControllerSpec, DerivedMembership, LoadBalancer};
use steward::Error;
use support::mocks::{member_address, Journal, MockComponent, MockMemberFactory, RecordingReconfigurer};

const CONFIG_URI: &str = "config.uri";

fn load_balancer(name: &str, service: &RecordingReconfigurer) -> Arc<LoadBalancer> {
    let spec = ControllerSpec::new(name, AddressSelectorConfig::host_and_port(HOST_AND_PORT.name()))
        .listening_on("lb.internal", 8000);
    Arc::new(LoadBalancer::new(spec, service.handle()))
}

fn mock_cluster(name: &str, size: usize, journal: &Journal) -> Arc<DynamicCluster> {
    Arc::new(DynamicCluster::new(
        name,
        size,
        Arc::new(MockMemberFactory::new(journal)),
    ))
}

async fn addresses_become(service: &RecordingReconfigurer, expected: Vec<String>) {
    common::eventually("service receives the member addresses", || {
        let latest = service.last_addresses();
        let expected = expected.clone();
        async move { latest == Some(expected) }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dependent_tier_is_started_at_once_and_completes_after_the_publish() {
    let journal = Journal::default();
    let a = Arc::new(
        MockComponent::new("A", &journal)
            .with_delay(Duration::from_millis(300))
            .publishing(CONFIG_URI, json!("mongodb://a:27019")),
    );
    let b = Arc::new(MockComponent::new("B", &journal).with_delay(Duration::from_millis(100)));
    let c = Arc::new(MockComponent::new("C", &journal).observing(CONFIG_URI));

    let composite = CompositeOrchestrator::builder("app")
        .tier(Tier::new("A", a.clone()))
        .tier(Tier::new("B", b.clone()))
        .tier(Tier::new("C", c.clone()).requires(Requirement::new("A", CONFIG_URI)))
        .build()
        .unwrap();

    composite.start(&[Location::new("rack-1")]).await.unwrap();
    assert_eq!(composite.lifecycle(), Lifecycle::Running);
    assert_eq!(c.observed(CONFIG_URI), Some(json!("mongodb://a:27019")));
    // C's start was issued while A was still starting, and completed only after A published.
    assert!(journal.position("start:C") < journal.position("started:A"));
    assert!(journal.position("started:A") < journal.position("started:C"));
    // A and B did not wait for each other.
    assert!(journal.position("start:B") < journal.position("started:A"));
    assert_eq!(c.last_locations(), vec![Location::new("rack-1")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_tier_sets_composite_on_fire_without_compensation() {
    let journal = Journal::default();
    let a = Arc::new(MockComponent::new("A", &journal));
    let b = Arc::new(MockComponent::new("B", &journal).failing_start("B exploded"));
    let c = Arc::new(MockComponent::new("C", &journal));

    let composite = CompositeOrchestrator::builder("fragile")
        .tier(Tier::new("A", a.clone()))
        .tier(Tier::new("B", b.clone()))
        .tier(Tier::new("C", c.clone()))
        .build()
        .unwrap();

    let err = composite.start(&[]).await.unwrap_err();
    match err {
        Error::SubComponentStart { component, source } => {
            assert_eq!(component, "B");
            assert_eq!(source.to_string(), "B exploded");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(composite.lifecycle(), Lifecycle::OnFire);
    for survivor in [&a, &c] {
        assert_eq!(survivor.start_count(), 1);
        assert_eq!(survivor.stop_count(), 0);
        assert_eq!(survivor.entity().attribute(&SERVICE_UP), Some(true));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn dependent_cluster_is_starting_while_it_waits() {
    let journal = Journal::default();
    let a = Arc::new(
        MockComponent::new("A", &journal)
            .with_delay(Duration::from_millis(300))
            .publishing(CONFIG_URI, json!("mongodb://a:27019")),
    );
    let shards = mock_cluster("shards", 2, &journal);

    let composite = CompositeOrchestrator::builder("sharded")
        .tier(Tier::new("A", a))
        .tier(Tier::new("shards", shards.clone()).requires(Requirement::new("A", CONFIG_URI)))
        .build()
        .unwrap();

    let sample = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        (
            shards.lifecycle(),
            shards.entity().attribute(&SERVICE_STATE),
            shards.current_size(),
        )
    };
    let (started, sampled) = tokio::join!(composite.start(&[]), sample);
    started.unwrap();

    assert_eq!(sampled, (Lifecycle::Starting, Some(Lifecycle::Starting), 0));
    assert_eq!(shards.lifecycle(), Lifecycle::Running);
    assert_eq!(shards.current_size(), 2);
    assert_eq!(
        shards.entity().attributes().get_raw(CONFIG_URI),
        Some(json!("mongodb://a:27019"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn dependency_wait_times_out() {
    let journal = Journal::default();
    let a = Arc::new(MockComponent::new("A", &journal));
    let c = Arc::new(MockComponent::new("C", &journal));

    let composite = CompositeOrchestrator::builder("impatient")
        .tier(Tier::new("A", a))
        .tier(
            Tier::new("C", c.clone())
                .requires(Requirement::new("A", CONFIG_URI).within(Duration::from_millis(100))),
        )
        .build()
        .unwrap();

    let err = composite.start(&[]).await.unwrap_err();
    match err {
        Error::SubComponentStart { component, source } => {
            assert_eq!(component, "C");
            assert!(matches!(*source, Error::Timeout(_)));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(composite.lifecycle(), Lifecycle::OnFire);
    assert_eq!(c.start_count(), 1);
    assert_eq!(journal.position("started:C"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_elsewhere_aborts_pending_waits() {
    let journal = Journal::default();
    let a = Arc::new(MockComponent::new("A", &journal).failing_start("A refused"));
    let c = Arc::new(MockComponent::new("C", &journal));

    let composite = CompositeOrchestrator::builder("aborted")
        .tier(Tier::new("A", a))
        .tier(Tier::new("C", c.clone()).requires(Requirement::new("A", CONFIG_URI)))
        .build()
        .unwrap();

    let err = tokio::time::timeout(common::WAIT, composite.start(&[]))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::SubComponentStart { ref component, .. } if component == "A"));
    assert_eq!(c.start_count(), 1);
    assert_eq!(journal.position("started:C"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_runs_in_reverse_dependency_order() {
    let journal = Journal::default();
    let db = Arc::new(MockComponent::new("db", &journal).publishing("db.uri", json!("db:5432")));
    let app = Arc::new(MockComponent::new("app", &journal).publishing("app.uri", json!("app:8080")));
    let edge = Arc::new(MockComponent::new("edge", &journal));

    let composite = CompositeOrchestrator::builder("ordered")
        .tier(Tier::new("edge", edge).requires(Requirement::new("app", "app.uri")))
        .tier(Tier::new("app", app).requires(Requirement::new("db", "db.uri")))
        .tier(Tier::new("db", db))
        .build()
        .unwrap();
    assert_eq!(composite.start_order(), vec!["db", "app", "edge"]);
    assert_eq!(composite.stop_order(), vec!["edge", "app", "db"]);

    composite.start(&[Location::new("rack-1")]).await.unwrap();
    composite.stop().await.unwrap();

    let stops: Vec<String> = journal
        .entries()
        .into_iter()
        .filter(|entry| entry.starts_with("stop:"))
        .collect();
    assert_eq!(stops, vec!["stop:edge", "stop:app", "stop:db"]);
    assert_eq!(composite.lifecycle(), Lifecycle::Stopped);
    assert!(composite.entity().locations().is_empty());
    assert_eq!(composite.entity().attribute(&SERVICE_UP), Some(false));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_tier_stop_sets_composite_on_fire_and_stops_the_rest() {
    let journal = Journal::default();
    let db = Arc::new(MockComponent::new("db", &journal));
    let app = Arc::new(MockComponent::new("app", &journal).failing_stop("app hung"));
    let edge = Arc::new(MockComponent::new("edge", &journal));

    let composite = CompositeOrchestrator::builder("stuck")
        .tier(Tier::new("db", db.clone()))
        .tier(Tier::new("app", app.clone()))
        .tier(Tier::new("edge", edge.clone()))
        .build()
        .unwrap();
    composite.start(&[Location::new("rack-1")]).await.unwrap();
    common::wait_for_attribute(composite.entity(), SERVICE_UP.name(), json!(true)).await;

    let err = composite.stop().await.unwrap_err();
    match err {
        Error::SubComponentStop { component, source } => {
            assert!(component.starts_with("app["), "{component}");
            assert_eq!(source.to_string(), "app hung");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(composite.lifecycle(), Lifecycle::OnFire);
    assert_eq!(composite.entity().attribute(&SERVICE_STATE), Some(Lifecycle::OnFire));
    assert_eq!(composite.entity().attribute(&SERVICE_UP), Some(false));
    for tier in [&db, &app, &edge] {
        assert_eq!(tier.stop_count(), 1);
    }

    // Stopping again from ON_FIRE is accepted.
    app.clear_stop_failure();
    composite.stop().await.unwrap();
    assert_eq!(composite.lifecycle(), Lifecycle::Stopped);
    assert_eq!(app.stop_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_is_unsupported_when_a_tier_is_pinned() {
    let journal = Journal::default();
    let db = Arc::new(MockComponent::new("db", &journal));
    let composite = CompositeOrchestrator::builder("pinned")
        .tier(Tier::new("db", db.clone()).restartable(false))
        .build()
        .unwrap();
    composite.start(&[]).await.unwrap();

    let err = composite.restart().await.unwrap_err();
    assert!(matches!(err, Error::Unsupported { operation: "restart", .. }));
    assert_eq!(composite.lifecycle(), Lifecycle::Running);
    assert_eq!(db.stop_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_stops_then_starts_at_the_same_locations() {
    let journal = Journal::default();
    let web = Arc::new(MockComponent::new("web", &journal));
    let composite = CompositeOrchestrator::builder("restartable")
        .tier(Tier::new("web", web.clone()))
        .build()
        .unwrap();
    composite.start(&[Location::new("rack-2")]).await.unwrap();

    composite.restart().await.unwrap();
    assert_eq!(composite.lifecycle(), Lifecycle::Running);
    assert_eq!(web.start_count(), 2);
    assert_eq!(web.stop_count(), 1);
    assert_eq!(web.last_locations(), vec![Location::new("rack-2")]);
}

#[test]
fn builder_reports_every_structural_problem() {
    let journal = Journal::default();
    let component = || Arc::new(MockComponent::new("x", &journal));

    let err = CompositeOrchestrator::builder("invalid")
        .tier(Tier::new("a", component()).requires(Requirement::new("b", "x")))
        .tier(Tier::new("b", component()).requires(Requirement::new("a", "x")))
        .tier(Tier::new("b", component()))
        .tier(Tier::new("c", component()).requires(Requirement::new("ghost", "x")))
        .propagate("nowhere", steward::entity::Selection::only(["x"]))
        .build()
        .err()
        .unwrap();

    let message = err.to_string();
    assert!(err.is_configuration());
    assert!(message.contains("tier `b` is declared more than once"));
    assert!(message.contains("requires unknown tier `ghost`"));
    assert!(message.contains("cannot propagate from unknown tier `nowhere`"));
    assert!(message.contains("form a cycle"));
}

#[tokio::test(flavor = "multi_thread")]
async fn controller_tier_is_bound_and_follows_its_pool() {
    let journal = Journal::default();
    let service = RecordingReconfigurer::new();
    let web = mock_cluster("web", 2, &journal);
    let lb = load_balancer("lb", &service);

    let composite = CompositeOrchestrator::builder("shop")
        .tier(Tier::controller("lb", lb.clone(), web.group().clone()))
        .tier(Tier::new("web", web.clone()))
        .propagate("lb", steward::entity::Selection::only([ROOT_URL.name()]))
        .build()
        .unwrap();
    assert_eq!(composite.start_order(), vec!["web", "lb"]);

    composite.start(&[]).await.unwrap();
    assert_eq!(lb.bound_pool().unwrap().name(), "web");
    addresses_become(&service, vec![member_address(0), member_address(1)]).await;
    assert_eq!(
        composite.entity().attribute(&ROOT_URL),
        Some("http://lb.internal:8000/".to_string())
    );

    web.resize(3).await.unwrap();
    addresses_become(
        &service,
        vec![member_address(0), member_address(1), member_address(2)],
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn composite_is_up_only_while_every_tier_is_up() {
    let journal = Journal::default();
    let a = Arc::new(MockComponent::new("A", &journal));
    let b = Arc::new(MockComponent::new("B", &journal));
    let composite = CompositeOrchestrator::builder("aggregate")
        .tier(Tier::new("A", a.clone()))
        .tier(Tier::new("B", b.clone()))
        .build()
        .unwrap();

    composite.start(&[]).await.unwrap();
    assert_eq!(composite.entity().attribute(&SERVICE_UP), Some(true));

    b.entity().set_attribute(&SERVICE_UP, false);
    common::wait_for_attribute(composite.entity(), SERVICE_UP.name(), json!(false)).await;
    b.entity().set_attribute(&SERVICE_UP, true);
    common::wait_for_attribute(composite.entity(), SERVICE_UP.name(), json!(true)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn derived_membership_mirrors_the_source_group() {
    let journal = Journal::default();
    let app = mock_cluster("app", 2, &journal);
    let pool = Group::new("pool");

    let composite = CompositeOrchestrator::builder("colocated")
        .tier(Tier::new("app", app.clone()))
        .derived_membership(app.group().clone(), DerivedMembership::identity(pool.clone()))
        .build()
        .unwrap();
    composite.start(&[]).await.unwrap();
    assert_eq!(pool.size(), 2);

    app.resize(3).await.unwrap();
    common::wait_for_attribute(pool.entity(), GROUP_SIZE.name(), json!(3)).await;

    app.resize(1).await.unwrap();
    common::wait_for_attribute(pool.entity(), GROUP_SIZE.name(), json!(1)).await;

    composite.stop().await.unwrap();
    let late = Entity::new("late");
    app.group().add_member(&late);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pool.has_member(&late));
}

#[tokio::test(flavor = "multi_thread")]
async fn controlled_cluster_starts_updates_and_stops_both_parts() {
    let journal = Journal::default();
    let service = RecordingReconfigurer::new();
    let cluster = mock_cluster("web", 2, &journal);
    let lb = load_balancer("web-lb", &service);
    let controlled = ControlledCluster::new("web-controlled", cluster.clone(), lb.clone());

    controlled.start(&[Location::new("edge")]).await.unwrap();
    assert_eq!(controlled.lifecycle(), Lifecycle::Running);
    assert_eq!(lb.lifecycle(), Lifecycle::Running);
    assert!(controlled.entity().is_parent_of(lb.entity()));
    assert_eq!(lb.entity().locations(), vec![Location::new("edge")]);
    addresses_become(&service, vec![member_address(0), member_address(1)]).await;

    common::wait_for_attribute(controlled.entity(), GROUP_SIZE.name(), json!(2)).await;
    common::wait_for_attribute(
        controlled.entity(),
        ROOT_URL.name(),
        json!("http://lb.internal:8000/"),
    )
    .await;
    common::wait_for_attribute(controlled.entity(), SERVICE_UP.name(), json!(true)).await;

    assert_eq!(controlled.resize(3).await.unwrap(), 3);
    assert_eq!(controlled.current_size(), 3);
    addresses_become(
        &service,
        vec![member_address(0), member_address(1), member_address(2)],
    )
    .await;

    controlled.stop().await.unwrap();
    assert_eq!(controlled.lifecycle(), Lifecycle::Stopped);
    assert_eq!(lb.lifecycle(), Lifecycle::Stopped);
    assert_eq!(cluster.lifecycle(), Lifecycle::Stopped);
    assert!(controlled.entity().locations().is_empty());
    assert_eq!(controlled.entity().attribute(&SERVICE_UP), Some(false));

    controlled.start(&[Location::new("edge-2")]).await.unwrap();
    assert_eq!(cluster.current_size(), 2);
    assert_eq!(lb.entity().locations(), vec![Location::new("edge-2")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn controlled_cluster_stop_failure_sets_it_on_fire() {
    let journal = Journal::default();
    let service = RecordingReconfigurer::new();
    let factory = MockMemberFactory::new(&journal);
    factory.fail_stop_index(1);
    let cluster = Arc::new(DynamicCluster::new("jammed", 2, Arc::new(factory)));
    let lb = load_balancer("jammed-lb", &service);
    let controlled = ControlledCluster::new("jammed-controlled", cluster.clone(), lb.clone());
    controlled.start(&[Location::new("edge")]).await.unwrap();

    let err = controlled.stop().await.unwrap_err();
    assert!(matches!(err, Error::SubComponentStop { ref component, .. } if component.starts_with("jammed[")));
    assert_eq!(controlled.lifecycle(), Lifecycle::OnFire);
    assert_eq!(controlled.entity().attribute(&SERVICE_UP), Some(false));
    assert!(controlled.entity().locations().is_empty());
    // The controller went first and still stopped.
    assert_eq!(lb.lifecycle(), Lifecycle::Stopped);
    assert!(journal.position("stop:jammed-0").is_some());

    controlled.stop().await.unwrap();
    assert_eq!(controlled.lifecycle(), Lifecycle::Stopped);
    assert_eq!(cluster.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn controller_owned_elsewhere_is_not_started() {
    let journal = Journal::default();
    let service = RecordingReconfigurer::new();
    let cluster = mock_cluster("api", 1, &journal);
    let lb = load_balancer("shared-lb", &service);
    let owner = Entity::new("edge-proxy");
    owner.add_child(lb.entity());

    let controlled = ControlledCluster::new("api-controlled", cluster, lb.clone());
    controlled.start(&[]).await.unwrap();

    assert_eq!(lb.lifecycle(), Lifecycle::Created);
    assert_eq!(lb.entity().parent(), Some(owner));
    assert_eq!(lb.bound_pool().unwrap().name(), "api");
    assert_eq!(service.reconfigure_count(), 0);
}
