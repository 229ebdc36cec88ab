//! Pre-plan scenario: conflicting compose ports are rewritten before
//! launch, everything else is left alone.

mod common;

use common::{MockContainer, MockRuntime};
use portshift::allocator::PortAllocator;
use portshift::compose::PrePlanner;
use portshift::ports::PortRange;
use portshift::runtime::ContainerRuntime;
use portshift::store::ContainerStore;
use std::sync::Arc;

#[tokio::test]
async fn conflicting_service_port_is_remapped_and_the_rest_untouched() {
    // S5: the store already tracks a container on 8080/tcp; the
    // descriptor wants web on 8080 and db on 55432.
    let mock = MockRuntime::new();
    mock.add(MockContainer::new("a1", "other", "nginx:latest").with_binding(8080, 80, "tcp"));
    let runtime: Arc<dyn ContainerRuntime> = mock.clone();
    let store = Arc::new(ContainerStore::new(runtime));
    store.refresh().await.expect("seed store");

    let range = PortRange::new(10000, 65000);
    let allocator = Arc::new(PortAllocator::new(store.clone(), range));
    let planner = PrePlanner::new(store, allocator);

    let descriptor = "services:\n  web:\n    ports:\n      - \"8080:80\"\n  db:\n    ports:\n      - \"55432:5432\"\n";
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("docker-compose.yml");
    std::fs::write(&path, descriptor).expect("write descriptor");

    let canonical = "services:\n  web:\n    ports:\n      - published: 8080\n        target: 80\n        protocol: tcp\n  db:\n    ports:\n      - published: 55432\n        target: 5432\n        protocol: tcp\n";

    let plan = planner
        .plan_canonical(canonical, &path)
        .await
        .expect("plan");

    let new_port = plan.remappings.get("web:8080").copied().expect("web moved");
    assert!(range.contains(new_port));
    assert!(!plan.remappings.contains_key("db:55432"));
    assert_eq!(plan.remappings.len(), 1);

    let rewritten = plan.rewritten_file.expect("rewritten descriptor");
    let content = std::fs::read_to_string(&rewritten).expect("read rewritten");
    std::fs::remove_file(&rewritten).expect("unlink");

    assert!(content.contains(&format!("{}:80", new_port)));
    assert!(content.contains("55432:5432"));
    assert!(!content.contains("8080:80"));
}

#[tokio::test]
async fn conflict_free_descriptor_needs_no_rewrite() {
    let mock = MockRuntime::new();
    let runtime: Arc<dyn ContainerRuntime> = mock.clone();
    let store = Arc::new(ContainerStore::new(runtime));
    store.refresh().await.expect("seed store");

    let range = PortRange::new(10000, 65000);
    let allocator = Arc::new(PortAllocator::new(store.clone(), range));
    let planner = PrePlanner::new(store, allocator);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("docker-compose.yml");
    std::fs::write(&path, "services: {}\n").expect("write descriptor");

    let canonical = "services:\n  db:\n    ports:\n      - published: 55433\n        target: 5432\n        protocol: tcp\n";
    let plan = planner
        .plan_canonical(canonical, &path)
        .await
        .expect("plan");

    assert!(plan.remappings.is_empty());
    assert!(plan.rewritten_file.is_none());
}
