//! Merge and grouping semantics of the container store.

mod common;

use common::{MockContainer, MockRuntime};
use portshift::runtime::ContainerRuntime;
use portshift::store::{ContainerStore, SENTINEL_LABEL, STANDALONE_GROUP};
use std::sync::Arc;

fn store_over(mock: &Arc<MockRuntime>) -> Arc<ContainerStore> {
    let runtime: Arc<dyn ContainerRuntime> = mock.clone();
    Arc::new(ContainerStore::new(runtime))
}

#[tokio::test]
async fn refresh_populates_records_and_bindings() {
    let mock = MockRuntime::new();
    mock.add(
        MockContainer::new("a1", "shop_web_1", "nginx:latest")
            .with_binding(8080, 80, "tcp")
            .with_label("com.docker.compose.project", "shop")
            .with_label("com.docker.compose.service", "web"),
    );
    let store = store_over(&mock);

    store.refresh().await.expect("refresh");

    let all = store.get_all().await;
    assert_eq!(all.len(), 1);
    let record = &all[0];
    assert_eq!(record.project, "shop");
    assert_eq!(record.service, "web");
    assert_eq!(record.bindings.len(), 1);
    assert_eq!(record.bindings[0].host_port, 8080);
    assert_eq!(record.bindings[0].original_port, 8080);
}

#[tokio::test]
async fn original_port_survives_repeated_refreshes() {
    let mock = MockRuntime::new();
    mock.add(MockContainer::new("b1", "web", "nginx:latest").with_binding(54321, 80, "tcp"));
    let store = store_over(&mock);

    // A relocation seeded the index before the container was listed.
    store.record_remap("b1", "80/tcp", 8080).await;

    for _ in 0..3 {
        store.refresh().await.expect("refresh");
        let all = store.get_all().await;
        assert_eq!(all[0].bindings[0].host_port, 54321);
        assert_eq!(all[0].bindings[0].original_port, 8080);
        assert!(all[0].has_remapped_ports());
    }
}

#[tokio::test]
async fn processed_ids_stay_processed_while_listed_and_drop_out_after() {
    let mock = MockRuntime::new();
    mock.add(MockContainer::new("p1", "web", "nginx:latest"));
    let store = store_over(&mock);
    store.refresh().await.expect("refresh");

    store.mark_processed("p1").await;
    store.refresh().await.expect("refresh");
    assert!(store.is_processed("p1").await);

    mock.take("p1");
    store.refresh().await.expect("refresh");
    assert!(store.get_all().await.is_empty());
    assert!(!store.is_processed("p1").await);
}

#[tokio::test]
async fn sentinel_label_is_trusted_and_cached() {
    let mock = MockRuntime::new();
    mock.add(MockContainer::new("s1", "web", "nginx:latest").with_label(SENTINEL_LABEL, "true"));
    let store = store_over(&mock);

    // Not in memory, but the label says a prior run owned it.
    assert!(store.is_processed("s1").await);

    // The positive answer is cached: losing the container (and with it
    // the label) does not flip an already-processed id back.
    mock.take("s1");
    assert!(store.is_processed("s1").await);
}

#[tokio::test]
async fn failed_listing_leaves_state_untouched() {
    let mock = MockRuntime::new();
    mock.add(MockContainer::new("a1", "web", "nginx:latest").with_binding(8080, 80, "tcp"));
    let store = store_over(&mock);
    store.refresh().await.expect("refresh");

    mock.set_fail_list(true);
    assert!(store.refresh().await.is_err());
    assert_eq!(store.get_all().await.len(), 1);
}

#[tokio::test]
async fn host_port_snapshots_answer_collision_queries() {
    let mock = MockRuntime::new();
    mock.add(MockContainer::new("a1", "web", "nginx:latest").with_binding(8080, 80, "tcp"));
    let store = store_over(&mock);
    store.refresh().await.expect("refresh");

    assert!(store.uses_host_port(8080).await);
    assert!(!store.uses_host_port(9090).await);
    assert!(store.holds_binding(8080, "tcp").await);
    assert!(!store.holds_binding(8080, "udp").await);
    assert!(store.held_by_other("zz", 8080, "tcp").await);
    assert!(!store.held_by_other("a1", 8080, "tcp").await);
}

#[tokio::test]
async fn groups_by_label_then_name_then_standalone() {
    let mock = MockRuntime::new();
    mock.add(
        MockContainer::new("l1", "whatever", "nginx:latest")
            .with_label("com.docker.compose.project", "shop"),
    );
    mock.add(MockContainer::new("n1", "billing_api_1", "api:latest"));
    mock.add(MockContainer::new("x1", "nginx", "nginx:latest"));
    let store = store_over(&mock);
    store.refresh().await.expect("refresh");

    let groups = store.group_by_project().await;
    assert_eq!(groups["shop"].len(), 1);
    assert_eq!(groups["billing"].len(), 1);
    assert_eq!(groups[STANDALONE_GROUP].len(), 1);
    assert_eq!(groups[STANDALONE_GROUP][0].name, "nginx");
}

#[tokio::test]
async fn alternative_project_labels_are_consulted_in_order() {
    let mock = MockRuntime::new();
    mock.add(
        MockContainer::new("alt1", "whatever", "nginx:latest")
            .with_label("io.compose.project", "legacy"),
    );
    let store = store_over(&mock);
    store.refresh().await.expect("refresh");

    let all = store.get_all().await;
    assert_eq!(all[0].project, "legacy");
}
