#[path = "../common/mod.rs"]
mod common;
#[path = "../support/mod.rs"]
mod support;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use steward::cluster::{DynamicCluster, MemberFactory, StaticMember, StaticMemberFactory, StaticServer};
use steward::entity::keys::{GROUP_SIZE, HOSTNAME, HOST_AND_PORT, HTTP_PORT, SERVICE_UP};
use steward::entity::{Entity, Location};
use steward::lifecycle::{Lifecycle, Startable};
use steward::Error;
use support::mocks::{member_address, Journal, MockMemberFactory};
use tokio::net::TcpListener;

fn cluster(name: &str, initial_size: usize, factory: &MockMemberFactory) -> DynamicCluster {
    DynamicCluster::new(name, initial_size, Arc::new(factory.clone()))
}

fn member_addresses(cluster: &DynamicCluster) -> Vec<String> {
    let mut addresses: Vec<String> = cluster
        .group()
        .members()
        .iter()
        .filter_map(|member| member.attribute(&HOST_AND_PORT))
        .collect();
    addresses.sort();
    addresses
}

#[tokio::test(flavor = "multi_thread")]
async fn start_creates_the_initial_members() {
    let journal = Journal::default();
    let factory = MockMemberFactory::new(&journal);
    let app = cluster("app", 2, &factory);
    assert_eq!(app.entity().attribute(&SERVICE_UP), Some(false));

    app.start(&[Location::new("rack-1")]).await.unwrap();
    assert_eq!(app.lifecycle(), Lifecycle::Running);
    assert_eq!(app.current_size(), 2);
    assert_eq!(app.entity().attribute(&GROUP_SIZE), Some(2));
    assert_eq!(app.entity().attribute(&SERVICE_UP), Some(true));
    assert_eq!(member_addresses(&app), vec![member_address(0), member_address(1)]);

    for member in app.group().members() {
        assert!(app.entity().is_parent_of(&member));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn resize_grows_then_shrinks_newest_first() {
    let journal = Journal::default();
    let factory = MockMemberFactory::new(&journal);
    let app = cluster("grow", 1, &factory);
    app.start(&[]).await.unwrap();

    assert_eq!(app.resize(4).await.unwrap(), 4);
    assert_eq!(factory.created(), 4);
    assert_eq!(app.entity().attribute(&GROUP_SIZE), Some(4));

    assert_eq!(app.resize(1).await.unwrap(), 1);
    let stops: Vec<String> = journal
        .entries()
        .into_iter()
        .filter(|entry| entry.starts_with("stop:"))
        .collect();
    assert_eq!(stops, vec!["stop:grow-3", "stop:grow-2", "stop:grow-1"]);
    assert_eq!(member_addresses(&app), vec![member_address(0)]);

    // Indexes are never reused.
    app.resize(2).await.unwrap();
    assert_eq!(member_addresses(&app), vec![member_address(0), member_address(4)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn resizing_to_the_current_size_changes_nothing() {
    let journal = Journal::default();
    let factory = MockMemberFactory::new(&journal);
    let app = cluster("steady", 2, &factory);
    app.start(&[]).await.unwrap();

    assert_eq!(app.resize(2).await.unwrap(), 2);
    assert_eq!(factory.created(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_member_is_removed_and_start_fails() {
    let journal = Journal::default();
    let factory = MockMemberFactory::new(&journal);
    factory.fail_index(1);
    let app = cluster("flaky", 3, &factory);

    let err = app.start(&[]).await.unwrap_err();
    match err {
        Error::SubComponentStart { component, .. } => assert!(component.starts_with("flaky-1")),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(app.lifecycle(), Lifecycle::OnFire);
    assert_eq!(app.current_size(), 2);
    assert_eq!(member_addresses(&app), vec![member_address(0), member_address(2)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn aggregate_up_follows_member_changes() {
    let journal = Journal::default();
    let factory = MockMemberFactory::new(&journal);
    let app = cluster("aggregate", 2, &factory);
    app.start(&[]).await.unwrap();

    let members = app.group().members();
    members[0].set_attribute(&SERVICE_UP, false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(app.entity().attribute(&SERVICE_UP), Some(true));

    members[1].set_attribute(&SERVICE_UP, false);
    common::wait_for_attribute(app.entity(), SERVICE_UP.name(), json!(false)).await;

    members[0].set_attribute(&SERVICE_UP, true);
    common::wait_for_attribute(app.entity(), SERVICE_UP.name(), json!(true)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_removes_every_member() {
    let journal = Journal::default();
    let factory = MockMemberFactory::new(&journal);
    let app = cluster("teardown", 2, &factory);
    app.start(&[Location::new("rack-1")]).await.unwrap();

    app.stop().await.unwrap();
    assert_eq!(app.lifecycle(), Lifecycle::Stopped);
    assert_eq!(app.current_size(), 0);
    assert!(app.entity().children().is_empty());
    assert!(app.entity().locations().is_empty());
    assert_eq!(app.entity().attribute(&SERVICE_UP), Some(false));
    assert!(journal.position("stop:teardown-1") < journal.position("stop:teardown-0"));
}

#[tokio::test(flavor = "multi_thread")]
async fn static_server_publishes_its_endpoint() {
    let server = StaticServer::new("db-1", "db.internal", 5432);
    server.start(&[]).await.unwrap();

    let entity = server.entity();
    assert_eq!(entity.attribute(&HOSTNAME), Some("db.internal".to_string()));
    assert_eq!(entity.attribute(&HTTP_PORT), Some(5432));
    assert_eq!(
        entity.attribute(&HOST_AND_PORT),
        Some("db.internal:5432".to_string())
    );
    assert_eq!(entity.attribute(&SERVICE_UP), Some(true));

    server.stop().await.unwrap();
    assert_eq!(entity.attribute(&SERVICE_UP), Some(false));
}

#[tokio::test(flavor = "multi_thread")]
async fn probe_succeeds_against_a_listening_port() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = StaticServer::new("probed", "127.0.0.1", port).with_probe(common::WAIT);
    server.start(&[]).await.unwrap();
    assert_eq!(server.lifecycle(), Lifecycle::Running);
}

#[tokio::test(flavor = "multi_thread")]
async fn probe_failure_puts_the_server_on_fire() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let server = StaticServer::new("closed", "127.0.0.1", port).with_probe(Duration::from_secs(1));
    assert!(server.start(&[]).await.is_err());
    assert_eq!(server.lifecycle(), Lifecycle::OnFire);
    assert_eq!(server.entity().attribute(&SERVICE_UP), Some(false));
}

#[tokio::test(flavor = "multi_thread")]
async fn static_factory_hands_out_declared_members_only() {
    let factory = StaticMemberFactory::new(
        vec![StaticMember {
            name: "web-a".into(),
            host: "10.1.0.1".into(),
            port: 8080,
        }],
        None,
    );
    let owner = Entity::new("web");

    let first = factory.create(&owner, 0).await.unwrap();
    assert_eq!(first.entity().name(), "web-a");

    let err = factory.create(&owner, 1).await.err().unwrap();
    assert!(err.is_configuration());
}

#[tokio::test(flavor = "multi_thread")]
async fn static_cluster_larger_than_its_members_fails_to_start() {
    let members = vec![StaticMember {
        name: "only".into(),
        host: "10.1.0.1".into(),
        port: 8080,
    }];
    let app = DynamicCluster::new("short", 2, Arc::new(StaticMemberFactory::new(members, None)));

    let err = app.start(&[]).await.unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(app.lifecycle(), Lifecycle::OnFire);
    assert_eq!(app.current_size(), 1);
}
