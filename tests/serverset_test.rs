//! ServerSet 集成测试
//!
//! 使用内存协调存储驱动注册、发现与负载均衡的完整流程

use flare_serverset::provider::ServiceProvider;
use flare_serverset::{
    Endpoint, Environment, HealthProbe, LoadBalanceStrategy, MemoryStore, ProviderRegistry,
    RegistryError, RoundRobinProvider, ServerSet, ServiceConfig, SmoothWeightedProvider, Watch,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::{Duration, timeout};
use tokio_test::{assert_err, assert_ok};

fn server_set(store: &MemoryStore, service: &str) -> ServerSet {
    ServerSet::new(
        Environment::Test,
        service,
        vec!["127.0.0.1:2181".to_string()],
        Arc::new(store.clone()),
    )
    .expect("valid service name")
}

/// 等待 Watch 快照长度收敛
async fn wait_for_len(watch: &Watch, len: usize) {
    timeout(Duration::from_secs(5), async {
        let mut events = watch.event();
        while watch.endpoints().len() != len {
            if events.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("watch did not converge");
    assert_eq!(watch.endpoints().len(), len);
}

async fn close_all(endpoints: Vec<Endpoint>) {
    for endpoint in endpoints {
        endpoint.close().await;
    }
}

/// 测试：节点数等于存活且未关闭的端点数
#[tokio::test]
async fn test_node_count_tracks_endpoints() {
    let store = MemoryStore::new();
    let set = server_set(&store, "user-service");
    let directory = set.directory_path();

    let mut endpoints = Vec::new();
    for port in 8001..8004 {
        endpoints.push(assert_ok!(set.register_endpoint("127.0.0.1", port, None).await));
    }
    assert_eq!(store.children(&directory).len(), 3);

    let first = endpoints.remove(0);
    first.close().await;
    assert_eq!(store.children(&directory).len(), 2);

    close_all(endpoints).await;
    assert!(store.children(&directory).is_empty());
}

/// 测试：N 个端点注册后创建的 Watch 初始即有 N 个成员
#[tokio::test]
async fn test_watch_initial_snapshot() {
    let store = MemoryStore::new();
    let set = server_set(&store, "orders");

    let mut endpoints = Vec::new();
    for port in [9000, 9001, 9002, 9003] {
        endpoints.push(set.register_endpoint("10.0.0.1", port, None).await.unwrap());
    }

    let watch = set.watch().await.unwrap();
    assert_eq!(watch.endpoints().len(), 4);
    assert_eq!(watch.event_count(), 0);

    close_all(endpoints).await;
    wait_for_len(&watch, 0).await;
    watch.close().await;
}

/// 测试：同一 host:port 注册两次得到两个节点，关闭一个后剩一个
#[tokio::test]
async fn test_duplicate_host_port() {
    let store = MemoryStore::new();
    let set = server_set(&store, "dup");
    let watch = set.watch().await.unwrap();

    let first = set.register_endpoint("127.0.0.1", 7000, None).await.unwrap();
    let second = set.register_endpoint("127.0.0.1", 7000, None).await.unwrap();
    assert_ne!(first.node_key().await, second.node_key().await);
    wait_for_len(&watch, 2).await;

    first.close().await;
    wait_for_len(&watch, 1).await;

    second.close().await;
    wait_for_len(&watch, 0).await;
    watch.close().await;
}

/// 测试：关闭操作幂等
#[tokio::test]
async fn test_idempotent_close() {
    let store = MemoryStore::new();
    let set = server_set(&store, "idem");
    let endpoint = set.register_endpoint("127.0.0.1", 1234, None).await.unwrap();
    let watch = set.watch().await.unwrap();

    endpoint.close().await;
    endpoint.close().await;
    watch.close().await;
    watch.close().await;

    assert!(watch.is_closed());
    assert!(store.children(&set.directory_path()).is_empty());
    assert!(store.session_ids().is_empty());
}

/// 测试：交替的健康检查结果使 Watch 观察到的端点数依次为 0,1,0,1
#[tokio::test(start_paused = true)]
async fn test_alternating_health_check() {
    let store = MemoryStore::new();
    let set = server_set(&store, "flapping").with_ping_interval(Duration::from_secs(1));
    let directory = set.directory_path();
    let watch = set.watch().await.unwrap();
    let mut events = watch.event();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let check: Arc<dyn HealthProbe> = Arc::new(move || {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if call % 2 == 0 {
                Err(anyhow::anyhow!("health check failed"))
            } else {
                Ok(())
            }
        }
    });

    let endpoint = set
        .register_endpoint("127.0.0.1", 8080, Some(check))
        .await
        .unwrap();

    let mut observed = vec![watch.endpoints().len()];
    while observed.len() < 4 {
        let changed = timeout(Duration::from_secs(10), events.changed())
            .await
            .expect("no liveness flip observed");
        assert_ok!(changed);
        observed.push(watch.endpoints().len());
    }
    assert_eq!(observed, vec![0, 1, 0, 1]);
    assert!(calls.load(Ordering::SeqCst) >= 4);

    endpoint.close().await;
    wait_for_len(&watch, 0).await;
    assert!(store.children(&directory).is_empty());
    watch.close().await;
}

/// 测试：端点会话过期后自动重新注册，Watch 跟随恢复
#[tokio::test]
async fn test_endpoint_reregisters_after_expiry() {
    let store = MemoryStore::new();
    let set = server_set(&store, "resilient");
    let watch = set.watch().await.unwrap();

    let endpoint = set.register_endpoint("10.9.9.9", 443, None).await.unwrap();
    wait_for_len(&watch, 1).await;
    let session_id = endpoint.session_id().await.unwrap();

    let mut events = watch.event();
    assert!(store.expire_session(session_id));
    timeout(Duration::from_secs(5), async {
        while endpoint.session_id().await == Some(session_id) || !endpoint.is_alive().await {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("endpoint did not re-register");

    assert_ok!(assert_ok!(
        timeout(Duration::from_secs(5), events.changed()).await
    ));
    wait_for_len(&watch, 1).await;

    endpoint.close().await;
    wait_for_len(&watch, 0).await;
    watch.close().await;
}

/// 测试：Watch 自身会话过期后重连并继续跟踪成员
#[tokio::test]
async fn test_watch_recovers_after_expiry() {
    let store = MemoryStore::new();
    let set = server_set(&store, "watch-recover");
    let watch = set.watch().await.unwrap();
    let watch_session = store.session_ids()[0];

    let mut events = watch.event();
    assert!(store.expire_session(watch_session));
    assert_ok!(events.changed().await);

    let endpoint = set.register_endpoint("10.0.0.5", 80, None).await.unwrap();
    wait_for_len(&watch, 1).await;

    endpoint.close().await;
    watch.close().await;
}

/// 测试：分组与版本隔离
#[tokio::test]
async fn test_group_isolation() {
    let store = MemoryStore::new();
    let set = server_set(&store, "gateway");

    let mut endpoints = Vec::new();
    for (port, group) in [(5001u16, "blue"), (5002, "blue"), (5003, "green")] {
        let meta = json!({ "group": group, "version": "v1" });
        endpoints.push(
            set.register_endpoint_with_meta("10.0.0.1", port, None, meta.as_object().unwrap().clone())
                .await
                .unwrap(),
        );
    }

    let blue = RoundRobinProvider::new(&set, ServiceConfig::new("blue", "v1"))
        .await
        .unwrap();
    let green = RoundRobinProvider::new(&set, ServiceConfig::new("green", "v1"))
        .await
        .unwrap();
    let other_version = RoundRobinProvider::new(&set, ServiceConfig::new("blue", "v2"))
        .await
        .unwrap();

    for _ in 0..10 {
        let selected = blue.select_server();
        assert!(selected == "http://10.0.0.1:5001" || selected == "http://10.0.0.1:5002");
        assert_eq!(green.select_server(), "http://10.0.0.1:5003");
        assert_eq!(other_version.select_server(), "");
    }

    blue.close().await;
    green.close().await;
    other_version.close().await;
    close_all(endpoints).await;
}

/// 测试：节点数据包含计算字段与元数据
#[tokio::test]
async fn test_payload_with_meta() {
    let store = MemoryStore::new();
    let set = server_set(&store, "payload");
    let meta = json!({ "zone": "az-1", "weight": 4, "rootPath": "/v1" });
    let endpoint = set
        .register_endpoint_with_meta("10.0.0.8", 9443, None, meta.as_object().unwrap().clone())
        .await
        .unwrap();

    let node_key = endpoint.node_key().await.unwrap();
    let data = store.data(&node_key).unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&data).unwrap();
    assert_eq!(payload["serviceEndpoint"], json!({ "host": "10.0.0.8", "port": 9443 }));
    assert_eq!(payload["status"], json!("ALIVE"));
    assert_eq!(payload["zone"], json!("az-1"));
    assert!(payload["registeredAt"].is_string());

    let provider = RoundRobinProvider::new(&set, ServiceConfig::default())
        .await
        .unwrap();
    let addresses = provider.addresses();
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0].weight, 4);
    assert_eq!(provider.select_server(), "http://10.0.0.8:9443/v1");

    provider.close().await;
    endpoint.close().await;
}

/// 测试：提供者在成员变化后重建地址
#[tokio::test]
async fn test_provider_follows_membership() {
    let store = MemoryStore::new();
    let set = server_set(&store, "elastic");
    let provider = SmoothWeightedProvider::new(&set, ServiceConfig::default())
        .await
        .unwrap();
    assert_eq!(provider.select_server(), "");

    let endpoint = set.register_endpoint("10.0.0.9", 8000, None).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while provider.addresses().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("provider did not observe new member");
    assert_eq!(provider.select_server(), "http://10.0.0.9:8000");

    endpoint.close().await;
    timeout(Duration::from_secs(5), async {
        while !provider.addresses().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("provider did not observe removal");
    assert_eq!(provider.select_server(), "");
    provider.close().await;
}

/// 测试：SWRR 选择次数与权重成比例
#[tokio::test]
async fn test_weighted_distribution() {
    let store = MemoryStore::new();
    let set = server_set(&store, "weighted");
    let mut endpoints = Vec::new();
    for (port, weight) in [(6001u16, 1), (6002, 3)] {
        let meta = json!({ "weight": weight.to_string() });
        endpoints.push(
            set.register_endpoint_with_meta("10.0.0.2", port, None, meta.as_object().unwrap().clone())
                .await
                .unwrap(),
        );
    }

    let registry = ProviderRegistry::new();
    let provider = registry
        .provider(
            &set,
            LoadBalanceStrategy::SmoothWeightedRoundRobin,
            ServiceConfig::default(),
        )
        .await
        .unwrap();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..40 {
        *counts.entry(provider.select_server()).or_default() += 1;
    }
    assert_eq!(counts["http://10.0.0.2:6001"], 10);
    assert_eq!(counts["http://10.0.0.2:6002"], 30);

    registry.close().await;
    close_all(endpoints).await;
}

/// 测试：非法服务名被拒绝
#[test]
fn test_invalid_service_name() {
    let result = ServerSet::new(
        Environment::Local,
        "bad/name",
        vec![],
        Arc::new(MemoryStore::new()),
    );
    assert_eq!(
        result.unwrap_err(),
        RegistryError::InvalidServiceName("bad/name".to_string())
    );
}

/// 测试：协调存储不可达时构造失败
#[tokio::test]
async fn test_unreachable_store() {
    let store = MemoryStore::new();
    store.set_reachable(false);
    let set = server_set(&store, "offline");

    let err = assert_err!(set.register_endpoint("127.0.0.1", 80, None).await);
    assert!(matches!(err, RegistryError::ConnectionFailed(_)));
    assert!(err.is_retryable());
    assert_err!(set.watch().await);
    assert!(
        RoundRobinProvider::new(&set, ServiceConfig::default())
            .await
            .is_err()
    );
}
