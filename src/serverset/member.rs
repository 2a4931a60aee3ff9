//! 成员键与节点数据编解码
//!
//! 成员键是协调存储中的节点名，形如
//! `{scheme}://{host}:{port}/{service}?group={g}&version={v}&weight={w}&rootPath={p}`
//! 整体 URL 编码后的字符串。顺序节点在其后追加 `~` 与序号。
//! 节点数据是 JSON，至少包含 `serviceEndpoint` 与 `status`。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::{RegistryError, Result};
use crate::store::SEQUENCE_SEPARATOR;

/// 默认协议
pub const DEFAULT_SCHEME: &str = "http";

/// 默认权重
pub const DEFAULT_WEIGHT: u32 = 1;

/// 存活状态
pub const STATUS_ALIVE: &str = "ALIVE";

/// 元数据中影响成员键的字段
pub const META_SCHEME: &str = "scheme";
pub const META_GROUP: &str = "group";
pub const META_VERSION: &str = "version";
pub const META_WEIGHT: &str = "weight";
pub const META_ROOT_PATH: &str = "rootPath";
pub const META_REGISTERED_AT: &str = "registeredAt";

/// 一个注册成员的结构化描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub service: String,
    pub group: String,
    pub version: String,
    pub weight: u32,
    pub root_path: String,
}

impl Member {
    pub fn new(host: impl Into<String>, port: u16, service: impl Into<String>) -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            host: host.into(),
            port,
            service: service.into(),
            group: String::new(),
            version: String::new(),
            weight: DEFAULT_WEIGHT,
            root_path: String::new(),
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = normalize_weight(Some(weight));
        self
    }

    pub fn with_root_path(mut self, root_path: impl Into<String>) -> Self {
        self.root_path = root_path.into();
        self
    }

    /// 从注册元数据构造成员；元数据中的 scheme/group/version/weight/rootPath 覆盖默认值
    pub fn from_meta(
        host: impl Into<String>,
        port: u16,
        service: impl Into<String>,
        meta: &Map<String, Value>,
    ) -> Self {
        let mut member = Self::new(host, port, service);
        if let Some(scheme) = meta_string(meta, META_SCHEME).filter(|s| !s.is_empty()) {
            member.scheme = scheme;
        }
        if let Some(group) = meta_string(meta, META_GROUP) {
            member.group = group;
        }
        if let Some(version) = meta_string(meta, META_VERSION) {
            member.version = version;
        }
        if let Some(root_path) = meta_string(meta, META_ROOT_PATH) {
            member.root_path = root_path;
        }
        member.weight = normalize_weight(
            meta_string(meta, META_WEIGHT).and_then(|w| w.parse::<u32>().ok()),
        );
        member
    }

    /// host:port
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 未编码的成员 URL
    pub fn to_url(&self) -> String {
        format!(
            "{}://{}:{}/{}?group={}&version={}&weight={}&rootPath={}",
            self.scheme,
            self.host,
            self.port,
            self.service,
            urlencoding::encode(&self.group),
            urlencoding::encode(&self.version),
            self.weight,
            urlencoding::encode(&self.root_path),
        )
    }

    /// 编码为节点名（不含 `/` 与 `~`）
    ///
    /// `~` 属于 URL 非保留字符，需额外转义为 `%7E` 以免与顺序后缀混淆
    pub fn encode(&self) -> String {
        urlencoding::encode(&self.to_url()).replace(SEQUENCE_SEPARATOR, "%7E")
    }

    /// 从节点名解码；顺序节点的序号后缀会被剥离，未知查询参数被忽略
    pub fn decode(node_name: &str) -> Result<Self> {
        let encoded = match node_name.rsplit_once(SEQUENCE_SEPARATOR) {
            Some((base, sequence)) if sequence.chars().all(|c| c.is_ascii_digit()) => base,
            _ => node_name,
        };
        let raw = urlencoding::decode(encoded)
            .map_err(|e| RegistryError::malformed_member(node_name, e.to_string()))?;
        let url = Url::parse(&raw)
            .map_err(|e| RegistryError::malformed_member(node_name, e.to_string()))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RegistryError::malformed_member(node_name, "missing host"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| RegistryError::malformed_member(node_name, "missing port"))?;

        let mut member = Self::new(host, port, url.path().trim_start_matches('/'))
            .with_scheme(url.scheme());
        let mut weight = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                META_GROUP => member.group = value.into_owned(),
                META_VERSION => member.version = value.into_owned(),
                META_ROOT_PATH => member.root_path = value.into_owned(),
                META_WEIGHT => weight = value.parse::<u32>().ok(),
                _ => {}
            }
        }
        member.weight = normalize_weight(weight);
        Ok(member)
    }
}

/// 缺失、非法或为零的权重按默认权重处理
fn normalize_weight(weight: Option<u32>) -> u32 {
    weight.filter(|w| *w > 0).unwrap_or(DEFAULT_WEIGHT)
}

fn meta_string(meta: &Map<String, Value>, key: &str) -> Option<String> {
    match meta.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// 节点数据中的服务地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
}

/// 节点数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePayload {
    pub service_endpoint: ServiceEndpoint,
    pub status: String,
    /// 调用方提供的其他元数据
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl NodePayload {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            service_endpoint: ServiceEndpoint {
                host: host.into(),
                port,
            },
            status: STATUS_ALIVE.to_string(),
            metadata: Map::new(),
        }
    }

    /// 合并调用方元数据；计算字段（serviceEndpoint/status）优先
    pub fn with_metadata(mut self, meta: &Map<String, Value>) -> Self {
        self.metadata = meta
            .iter()
            .filter(|(key, _)| key.as_str() != "serviceEndpoint" && key.as_str() != "status")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !self.metadata.contains_key(META_REGISTERED_AT) {
            self.metadata.insert(
                META_REGISTERED_AT.to_string(),
                Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn is_alive(&self) -> bool {
        self.status == STATUS_ALIVE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encoded_key_has_no_separators() {
        let member = Member::new("localhost", 8080, "user-service")
            .with_group("canary")
            .with_version("1.0.0")
            .with_root_path("/api/v1");
        let encoded = member.encode();
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains(SEQUENCE_SEPARATOR));
        assert_eq!(Member::decode(&encoded).unwrap(), member);
    }

    #[test]
    fn test_tilde_in_key_fields_survives_round_trip() {
        let member = Member::new("h", 1, "svc~edge")
            .with_version("1.0~rc1")
            .with_root_path("/v~2");
        let encoded = member.encode();
        assert!(!encoded.contains(SEQUENCE_SEPARATOR));
        assert_eq!(Member::decode(&encoded).unwrap(), member);

        let node = format!("{}~0000000005", encoded);
        let decoded = Member::decode(&node).unwrap();
        assert_eq!(decoded.root_path, "/v~2");
        assert_eq!(decoded.version, "1.0~rc1");
        assert_eq!(decoded.service, "svc~edge");
    }

    #[test]
    fn test_decode_strips_sequence_suffix() {
        let member = Member::new("10.0.0.7", 9000, "orders").with_weight(5);
        let node = format!("{}~0000000042", member.encode());
        let decoded = Member::decode(&node).unwrap();
        assert_eq!(decoded.weight, 5);
        assert_eq!(decoded.address(), "10.0.0.7:9000");
        assert_eq!(decoded.service, "orders");
    }

    #[test]
    fn test_decode_defaults_and_unknown_params() {
        let raw = "grpc://svc-host:7000/billing?group=a&foo=bar&weight=abc";
        let decoded = Member::decode(&urlencoding::encode(raw)).unwrap();
        assert_eq!(decoded.scheme, "grpc");
        assert_eq!(decoded.group, "a");
        assert_eq!(decoded.version, "");
        assert_eq!(decoded.weight, DEFAULT_WEIGHT);
        assert_eq!(decoded.root_path, "");

        let zero = "http://h:1/s?weight=0";
        assert_eq!(
            Member::decode(&urlencoding::encode(zero)).unwrap().weight,
            DEFAULT_WEIGHT
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Member::decode("member_0000000001"),
            Err(RegistryError::MalformedMember { .. })
        ));
        assert!(Member::decode(&urlencoding::encode("mailto:someone")).is_err());
    }

    #[test]
    fn test_from_meta() {
        let meta = json!({
            "group": "blue",
            "version": "v2",
            "weight": 3,
            "rootPath": "/rpc",
            "scheme": "https",
            "build": "abc123"
        });
        let member = Member::from_meta("127.0.0.1", 443, "gateway", meta.as_object().unwrap());
        assert_eq!(member.scheme, "https");
        assert_eq!(member.group, "blue");
        assert_eq!(member.version, "v2");
        assert_eq!(member.weight, 3);
        assert_eq!(member.root_path, "/rpc");
    }

    #[test]
    fn test_payload_merges_metadata() {
        let meta = json!({
            "group": "blue",
            "status": "DEAD",
            "serviceEndpoint": "bogus"
        });
        let payload = NodePayload::new("localhost", 1).with_metadata(meta.as_object().unwrap());
        let bytes = payload.to_bytes().unwrap();

        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["serviceEndpoint"], json!({"host": "localhost", "port": 1}));
        assert_eq!(value["status"], json!("ALIVE"));
        assert_eq!(value["group"], json!("blue"));
        assert!(value.get(META_REGISTERED_AT).is_some());

        let parsed = NodePayload::from_bytes(&bytes).unwrap();
        assert!(parsed.is_alive());
        assert_eq!(parsed.service_endpoint.port, 1);
    }
}
