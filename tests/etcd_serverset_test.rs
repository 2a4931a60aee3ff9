//! etcd 协调存储集成测试
//!
//! 这些测试需要运行中的 etcd 服务器实例。
//! 默认情况下，测试会被忽略，需要使用
//! `cargo test --features etcd --test etcd_serverset_test -- --ignored` 运行。
//!
//! 启动 etcd 服务器：
//! ```bash
//! docker run -d --name etcd-test -p 2379:2379 -p 2380:2380 \
//!   quay.io/coreos/etcd:v3.5.9 \
//!   etcd --advertise-client-urls=http://127.0.0.1:2379 \
//!        --listen-client-urls=http://0.0.0.0:2379
//! ```

#![cfg(feature = "etcd")]

use flare_serverset::provider::ServiceProvider;
use flare_serverset::{
    EtcdConnector, Environment, RoundRobinProvider, ServerSet, ServiceConfig, Watch,
};
use std::sync::Arc;
use tokio::time::{Duration, timeout};

/// etcd 服务器地址，可以通过环境变量 ETCD_ENDPOINTS 覆盖
fn etcd_endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["http://127.0.0.1:2379".to_string()])
}

fn server_set(service: &str) -> ServerSet {
    let connector = EtcdConnector::new().with_connect_timeout(Duration::from_secs(5));
    ServerSet::new(Environment::Test, service, etcd_endpoints(), Arc::new(connector))
        .expect("valid service name")
        .with_session_timeout(Duration::from_secs(5))
}

async fn wait_for_len(watch: &Watch, len: usize) {
    timeout(Duration::from_secs(10), async {
        let mut events = watch.event();
        while watch.endpoints().len() != len {
            if events.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("watch did not converge");
}

/// 测试：在 etcd 上注册、发现并选择端点
#[tokio::test]
#[ignore]
async fn test_etcd_register_and_select() {
    let set = server_set(&format!("etcd-it-{}", std::process::id()));
    let watch = set.watch().await.expect("watch");

    let first = set.register_endpoint("127.0.0.1", 18080, None).await.expect("register");
    let second = set.register_endpoint("127.0.0.1", 18081, None).await.expect("register");
    wait_for_len(&watch, 2).await;

    let provider = RoundRobinProvider::new(&set, ServiceConfig::default())
        .await
        .expect("provider");
    let picks = [provider.select_server(), provider.select_server()];
    assert!(picks.contains(&"http://127.0.0.1:18080".to_string()));
    assert!(picks.contains(&"http://127.0.0.1:18081".to_string()));

    first.close().await;
    wait_for_len(&watch, 1).await;

    second.close().await;
    wait_for_len(&watch, 0).await;

    provider.close().await;
    watch.close().await;
}
