#[path = "../common/mod.rs"]
mod common;

use serde_json::json;
use std::time::Duration;
use steward::entity::keys::{GROUP_SIZE, HOSTNAME, HOST_AND_PORT, ROOT_URL, SERVICE_UP};
use steward::entity::{
    attribute_when_ready, attribute_when_ready_raw, Entity, Group, Location, MembershipEvent,
    Propagator, Selection,
};
use steward::Error;
use tokio_util::sync::CancellationToken;

#[test]
fn children_and_parents_stay_consistent_when_reparented() {
    let first = Entity::new("first");
    let second = Entity::new("second");
    let child = Entity::new("child");

    first.add_child(&child);
    assert_eq!(child.parent(), Some(first.clone()));

    second.add_child(&child);
    assert_eq!(child.parent(), Some(second.clone()));
    assert!(first.children().is_empty());
    assert!(second.is_parent_of(&child));

    assert!(second.remove_child(&child));
    assert!(child.parent().is_none());
}

#[test]
fn setting_the_same_value_is_not_a_change() {
    let entity = Entity::new("web");
    let mut changes = entity.attributes().subscribe();

    assert!(entity.set_attribute(&HOSTNAME, "web-1".to_string()));
    assert!(!entity.set_attribute(&HOSTNAME, "web-1".to_string()));

    let change = changes.try_recv().unwrap();
    assert_eq!(change.name, "host.name");
    assert!(changes.try_recv().is_err());
}

#[test]
fn locations_are_replaced_and_cleared() {
    let entity = Entity::new("web");
    entity.set_locations(&[Location::new("rack-1"), Location::new("rack-2")]);
    assert_eq!(entity.locations().len(), 2);
    entity.clear_locations();
    assert!(entity.locations().is_empty());
}

#[test]
fn group_membership_is_counted_and_announced() {
    let group = Group::new("web");
    let mut events = group.subscribe();
    let member = Entity::new("web-1");

    assert!(group.add_member(&member));
    assert!(!group.add_member(&member));
    assert_eq!(group.entity().attribute(&GROUP_SIZE), Some(1));
    assert!(matches!(events.try_recv().unwrap(), MembershipEvent::Added(added) if added == member));

    assert!(group.remove_member(&member));
    assert_eq!(group.size(), 0);
    assert!(matches!(events.try_recv().unwrap(), MembershipEvent::Removed(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn waiting_suspends_until_a_ready_value_is_published() {
    let entity = Entity::new("config-servers");
    let publisher = entity.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher.set_attribute(&HOST_AND_PORT, String::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher.set_attribute(&HOST_AND_PORT, "10.0.0.9:27019".to_string());
    });

    let value = attribute_when_ready(
        &entity,
        &HOST_AND_PORT,
        Some(common::WAIT),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(value, "10.0.0.9:27019");
}

#[tokio::test(flavor = "multi_thread")]
async fn waiting_times_out() {
    let entity = Entity::new("never");
    let err = attribute_when_ready_raw(
        &entity,
        "main.uri",
        Some(Duration::from_millis(50)),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn waiting_is_cancellable() {
    let entity = Entity::new("never");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = attribute_when_ready_raw(&entity, "main.uri", None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test(flavor = "multi_thread")]
async fn propagator_copies_current_and_future_values() {
    let producer = Entity::new("cluster");
    let consumer = Entity::new("app");
    producer.set_attribute(&HOSTNAME, "lb.internal".to_string());
    producer.set_attribute(&SERVICE_UP, true);

    let shutdown = CancellationToken::new();
    let handle = Propagator::new(
        producer.clone(),
        consumer.clone(),
        Selection::all_but([SERVICE_UP.name()]),
    )
    .spawn(shutdown.clone());

    assert_eq!(consumer.attribute(&HOSTNAME), Some("lb.internal".to_string()));
    assert_eq!(consumer.attribute(&SERVICE_UP), None);

    producer.set_attribute(&ROOT_URL, "http://lb.internal/".to_string());
    common::wait_for_attribute(&consumer, ROOT_URL.name(), json!("http://lb.internal/")).await;

    shutdown.cancel();
    handle.await.unwrap();
    producer.set_attribute(&HOSTNAME, "moved.internal".to_string());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(consumer.attribute(&HOSTNAME), Some("lb.internal".to_string()));
}
