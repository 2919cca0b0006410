use anyhow::{bail, Result};
use serde::Deserialize;

use crate::model::ConnectionIdentity;

/// One text frame from a Clash-compatible `/connections` stream.
///
/// The top-level totals are informational only; the per-connection array
/// is authoritative for delta computation.
#[derive(Debug, Clone, Deserialize)]
pub struct TrafficFrame {
    #[serde(rename = "downloadTotal", default)]
    pub download_total: u64,
    #[serde(rename = "uploadTotal", default)]
    pub upload_total: u64,
    #[serde(default)]
    pub connections: Vec<WireConnection>,
}

/// Wire shape of a single connection entry.
#[derive(Debug, Clone, Deserialize)]
pub struct WireConnection {
    pub id: String,
    #[serde(default)]
    pub upload: u64,
    #[serde(default)]
    pub download: u64,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default)]
    pub rule: String,
    #[serde(rename = "rulePayload", default)]
    pub rule_payload: String,
    #[serde(default)]
    pub metadata: WireMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireMetadata {
    #[serde(default)]
    pub host: String,
    #[serde(rename = "destinationIP", default)]
    pub destination_ip: String,
    #[serde(rename = "destinationPort", default)]
    pub destination_port: String,
    #[serde(rename = "sourceIP", default)]
    pub source_ip: String,
    #[serde(rename = "sourcePort", default)]
    pub source_port: String,
    #[serde(default)]
    pub network: String,
    #[serde(rename = "type", default)]
    pub conn_type: String,
    #[serde(default)]
    pub process: Option<String>,
}

/// Flattened snapshot of one open connection, as handed to the delta
/// computer.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: String,
    pub upload: u64,
    pub download: u64,
    pub start: String,
    pub chains: Vec<String>,
    pub rule: String,
    pub rule_payload: String,
    pub host: String,
    pub destination_ip: String,
    pub destination_port: String,
    pub source_ip: String,
    pub source_port: String,
    pub network: String,
    pub conn_type: String,
    pub process: Option<String>,
}

impl ConnectionSnapshot {
    /// Builds the frozen identity for this connection. Hostless entries
    /// fall back to the destination IP so DNS-bypassing traffic still
    /// lands in the domain dimension.
    pub fn identity(&self) -> ConnectionIdentity {
        let host = if self.host.is_empty() {
            self.destination_ip.clone()
        } else {
            self.host.clone()
        };
        ConnectionIdentity {
            host,
            destination_ip: self.destination_ip.clone(),
            chain: canonical_chain(&self.chains),
            landing: landing_proxy(&self.chains),
            rule: self.rule.clone(),
            source_ip: self.source_ip.clone(),
            network: self.network.clone(),
            process: self.process.clone(),
        }
    }
}

impl From<WireConnection> for ConnectionSnapshot {
    fn from(w: WireConnection) -> Self {
        Self {
            id: w.id,
            upload: w.upload,
            download: w.download,
            start: w.start,
            chains: w.chains,
            rule: w.rule,
            rule_payload: w.rule_payload,
            host: w.metadata.host,
            destination_ip: w.metadata.destination_ip,
            destination_port: w.metadata.destination_port,
            source_ip: w.metadata.source_ip,
            source_port: w.metadata.source_port,
            network: w.metadata.network,
            conn_type: w.metadata.conn_type,
            process: w.metadata.process,
        }
    }
}

/// Decodes one inbound text frame.
pub fn decode_frame(text: &str) -> Result<Vec<ConnectionSnapshot>> {
    let frame: TrafficFrame = serde_json::from_str(text)?;
    Ok(frame.connections.into_iter().map(Into::into).collect())
}

/// Canonical chain string: upstream reports proxy-first, joined with
/// `" > "`. Display layers reverse it; the core never does.
pub fn canonical_chain(chains: &[String]) -> String {
    if chains.is_empty() {
        return "DIRECT".to_string();
    }
    chains.join(" > ")
}

/// First segment of the chain, or "DIRECT" for empty chains.
pub fn landing_proxy(chains: &[String]) -> String {
    chains
        .first()
        .cloned()
        .unwrap_or_else(|| "DIRECT".to_string())
}

/// Normalizes a configured backend URL into the WebSocket subscription
/// endpoint: `http(s)` maps to `ws(s)`, and `/connections` is appended
/// when absent.
pub fn subscription_url(url: &str) -> Result<String> {
    let url = url.trim().trim_end_matches('/');
    if url.is_empty() {
        bail!("backend url is empty");
    }

    let url = if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_string()
    } else {
        format!("ws://{url}")
    };

    if url.ends_with("/connections") {
        Ok(url)
    } else {
        Ok(format!("{url}/connections"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_frame() {
        let text = r#"{
            "downloadTotal": 5000,
            "uploadTotal": 1000,
            "connections": [{
                "id": "c1",
                "upload": 100,
                "download": 1000,
                "start": "2024-05-01T10:00:00Z",
                "chains": ["Proxy", "Rule"],
                "rule": "RuleSet",
                "rulePayload": "streaming",
                "metadata": {
                    "host": "a.example",
                    "destinationIP": "1.2.3.4",
                    "destinationPort": "443",
                    "sourceIP": "192.168.1.10",
                    "sourcePort": "52000",
                    "network": "tcp",
                    "type": "HTTPS"
                }
            }]
        }"#;

        let conns = decode_frame(text).expect("frame decodes");
        assert_eq!(conns.len(), 1);
        let c = &conns[0];
        assert_eq!(c.id, "c1");
        assert_eq!(c.upload, 100);
        assert_eq!(c.download, 1000);
        assert_eq!(c.host, "a.example");
        assert_eq!(c.chains, vec!["Proxy", "Rule"]);
    }

    #[test]
    fn test_decode_frame_rejects_garbage() {
        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn test_decode_frame_tolerates_missing_fields() {
        let conns = decode_frame(r#"{"connections": [{"id": "x"}]}"#).expect("decodes");
        assert_eq!(conns[0].upload, 0);
        assert!(conns[0].host.is_empty());
    }

    #[test]
    fn test_canonical_chain() {
        let chains = vec!["Proxy".to_string(), "Group".to_string(), "Rule".to_string()];
        assert_eq!(canonical_chain(&chains), "Proxy > Group > Rule");
        assert_eq!(canonical_chain(&[]), "DIRECT");
    }

    #[test]
    fn test_landing_proxy() {
        assert_eq!(landing_proxy(&["P".to_string(), "R".to_string()]), "P");
        assert_eq!(landing_proxy(&[]), "DIRECT");
    }

    #[test]
    fn test_identity_falls_back_to_destination_ip() {
        let mut conn: ConnectionSnapshot = WireConnection {
            id: "c".into(),
            upload: 0,
            download: 0,
            start: String::new(),
            chains: vec![],
            rule: String::new(),
            rule_payload: String::new(),
            metadata: WireMetadata::default(),
        }
        .into();
        conn.destination_ip = "9.9.9.9".into();
        assert_eq!(conn.identity().host, "9.9.9.9");
    }

    #[test]
    fn test_subscription_url_scheme_mapping() {
        assert_eq!(
            subscription_url("http://127.0.0.1:9090").expect("valid"),
            "ws://127.0.0.1:9090/connections",
        );
        assert_eq!(
            subscription_url("https://router.lan").expect("valid"),
            "wss://router.lan/connections",
        );
        assert_eq!(
            subscription_url("ws://router.lan/connections").expect("valid"),
            "ws://router.lan/connections",
        );
        assert_eq!(
            subscription_url("router.lan:9090/").expect("valid"),
            "ws://router.lan:9090/connections",
        );
    }

    #[test]
    fn test_subscription_url_rejects_empty() {
        assert!(subscription_url("  ").is_err());
    }
}
