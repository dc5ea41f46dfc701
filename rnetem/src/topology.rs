//! Topology document model and validation.
//!
//! `network.yml` declares nodes, point-to-point links and host bridges. The
//! validator is pure: it either returns a fully-resolved [`Topology`] graph
//! or the complete list of problems, never a partial graph and never a side
//! effect.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use rnetem_tc::Impairment;

/// Known node variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Router,
    Host,
    Ovs,
}

impl NodeKind {
    /// Parse a document `type` tag. Unknown tags are a validation error, not
    /// a deserialization failure, so they aggregate with everything else.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "router" => Some(Self::Router),
            "host" => Some(Self::Host),
            "ovs" => Some(Self::Ovs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Host => "host",
            Self::Ovs => "ovs",
        }
    }
}

/// One node entry in the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub ipv6: bool,
    pub mpls: bool,
    pub vrfs: Vec<String>,
    pub vrrps: Vec<String>,
    pub volumes: Vec<String>,
    /// Overrides the image configured for this node kind.
    pub image: Option<String>,
}

/// One link entry. `peer1`/`peer2` are `<nodeName>.<ifIndex>` endpoints;
/// delay and jitter are milliseconds, rate is kbit/s, loss is percent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    pub peer1: String,
    pub peer2: String,
    #[serde(default)]
    pub loss: f64,
    #[serde(default)]
    pub delay: i64,
    #[serde(default)]
    pub jitter: i64,
    #[serde(default)]
    pub rate: i64,
}

/// One host-bridge entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Host NIC to enslave, if any.
    pub host: Option<String>,
    /// Member legs, `<nodeName>.<ifIndex>` each.
    pub interfaces: Vec<String>,
}

/// The raw document, as serialized in `network.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyFile {
    pub nodes: BTreeMap<String, NodeConfig>,
    pub links: Vec<LinkConfig>,
    pub bridges: BTreeMap<String, BridgeConfig>,
}

/// A link endpoint resolved to `(node name, interface index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub node: String,
    pub if_index: usize,
}

/// A validated link.
#[derive(Debug, Clone)]
pub struct TopologyLink {
    pub peer1: Endpoint,
    pub peer2: Endpoint,
    pub impairment: Impairment,
}

/// A validated bridge.
#[derive(Debug, Clone)]
pub struct TopologyBridge {
    pub name: String,
    pub host: Option<String>,
    pub legs: Vec<Endpoint>,
}

/// A validated node.
#[derive(Debug, Clone)]
pub struct TopologyNode {
    pub name: String,
    pub kind: NodeKind,
    pub config: NodeConfig,
}

/// The validated in-memory graph.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub nodes: Vec<TopologyNode>,
    pub links: Vec<TopologyLink>,
    pub bridges: Vec<TopologyBridge>,
}

impl TopologyFile {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Read and deserialize a document. A syntax error is reported the same
    /// way as a semantic one: a single-entry error list.
    pub fn read(path: &Path) -> Result<Self, Vec<String>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| vec![format!("cannot read {}: {e}", path.display())])?;
        Self::from_yaml(&contents).map_err(|e| vec![format!("document syntax: {e}")])
    }

    /// Run every structural check and return the full error list, empty when
    /// the document is valid.
    pub fn check(&self) -> Vec<String> {
        match self.validate() {
            Ok(_) => Vec::new(),
            Err(errors) => errors,
        }
    }

    /// Validate and resolve into a [`Topology`] graph.
    pub fn validate(&self) -> Result<Topology, Vec<String>> {
        let mut errors = Vec::new();
        let mut topology = Topology::default();

        for (name, config) in &self.nodes {
            if name.is_empty() {
                errors.push("node with an empty name".to_string());
                continue;
            }
            if name.contains('.') {
                errors.push(format!(
                    "node {name}: name must not contain '.', it separates interface indexes"
                ));
            }
            match NodeKind::parse(&config.kind) {
                Some(kind) => topology.nodes.push(TopologyNode {
                    name: name.clone(),
                    kind,
                    config: config.clone(),
                }),
                None => errors.push(format!("node {name}: unknown type {:?}", config.kind)),
            }
        }

        // Every interface may appear once across all link endpoints and
        // bridge legs combined.
        let mut usage: HashMap<Endpoint, u32> = HashMap::new();

        for (index, link) in self.links.iter().enumerate() {
            let label = format!("link[{index}]");
            let peer1 = self.parse_endpoint(&link.peer1, &label, "peer1", &mut errors);
            let peer2 = self.parse_endpoint(&link.peer2, &label, "peer2", &mut errors);

            if !(0.0..=100.0).contains(&link.loss) {
                errors.push(format!("{label}: loss {} is not within [0, 100]", link.loss));
            }
            if link.delay < 0 {
                errors.push(format!("{label}: delay {} is negative", link.delay));
            }
            if link.jitter < 0 {
                errors.push(format!("{label}: jitter {} is negative", link.jitter));
            }
            if link.rate < 0 {
                errors.push(format!("{label}: rate {} is negative", link.rate));
            }

            let (Some(peer1), Some(peer2)) = (peer1, peer2) else { continue };
            *usage.entry(peer1.clone()).or_default() += 1;
            *usage.entry(peer2.clone()).or_default() += 1;

            topology.links.push(TopologyLink {
                peer1,
                peer2,
                impairment: Impairment {
                    delay_ms: link.delay.max(0) as u32,
                    jitter_ms: link.jitter.max(0) as u32,
                    loss: link.loss,
                    rate_kbps: link.rate.max(0) as u32,
                },
            });
        }

        for (name, bridge) in &self.bridges {
            let label = format!("bridge {name}");
            let mut legs = Vec::new();
            for (index, interface) in bridge.interfaces.iter().enumerate() {
                let field = format!("interfaces[{index}]");
                if let Some(leg) = self.parse_endpoint(interface, &label, &field, &mut errors) {
                    *usage.entry(leg.clone()).or_default() += 1;
                    legs.push(leg);
                }
            }
            topology.bridges.push(TopologyBridge {
                name: name.clone(),
                host: bridge.host.clone(),
                legs,
            });
        }

        let mut reused: Vec<_> = usage.into_iter().filter(|(_, count)| *count > 1).collect();
        reused.sort_by(|a, b| a.0.node.cmp(&b.0.node).then(a.0.if_index.cmp(&b.0.if_index)));
        for (endpoint, count) in reused {
            errors.push(format!(
                "interface {}.{} is used {count} times across links and bridges",
                endpoint.node, endpoint.if_index
            ));
        }

        if errors.is_empty() {
            Ok(topology)
        } else {
            Err(errors)
        }
    }

    /// Parse `<name>.<ifIndex>`, checking the name exists and the index is a
    /// non-negative integer. Problems go into `errors`.
    fn parse_endpoint(
        &self,
        endpoint: &str,
        label: &str,
        field: &str,
        errors: &mut Vec<String>,
    ) -> Option<Endpoint> {
        let Some((name, index)) = endpoint.rsplit_once('.') else {
            errors.push(format!("{label}: {field} {endpoint:?} is not of the form <node>.<ifIndex>"));
            return None;
        };

        let if_index = match index.parse::<i64>() {
            Ok(value) if value >= 0 => value as usize,
            Ok(value) => {
                errors.push(format!("{label}: {field} interface index {value} is negative"));
                return None;
            }
            Err(_) => {
                errors.push(format!(
                    "{label}: {field} {endpoint:?} has a non-integer interface index"
                ));
                return None;
            }
        };

        if !self.nodes.contains_key(name) {
            errors.push(format!("{label}: {field} references unknown node {name}"));
            return None;
        }

        Some(Endpoint { node: name.to_string(), if_index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_ROUTERS: &str = "\
nodes:
  r1: {type: router}
  r2: {type: router}
links:
  - {peer1: r1.0, peer2: r2.0}
";

    #[test]
    fn minimal_document_is_valid() {
        let file = TopologyFile::from_yaml(TWO_ROUTERS).unwrap();
        assert!(file.check().is_empty());

        let topology = file.validate().unwrap();
        assert_eq!(topology.nodes.len(), 2);
        assert_eq!(topology.links.len(), 1);
        assert_eq!(topology.links[0].peer1, Endpoint { node: "r1".into(), if_index: 0 });
        assert!(topology.links[0].impairment.is_transparent());
    }

    #[test]
    fn impairments_carry_through() {
        let yaml = "\
nodes:
  r1: {type: router}
  r2: {type: router}
links:
  - {peer1: r1.0, peer2: r2.0, loss: 1.5, delay: 50, jitter: 5, rate: 1000}
";
        let topology = TopologyFile::from_yaml(yaml).unwrap().validate().unwrap();
        let impairment = topology.links[0].impairment;
        assert_eq!(impairment.delay_ms, 50);
        assert_eq!(impairment.jitter_ms, 5);
        assert_eq!(impairment.loss, 1.5);
        assert_eq!(impairment.rate_kbps, 1000);
    }

    #[test]
    fn all_problems_are_aggregated() {
        let yaml = "\
nodes:
  r1: {type: router}
  x1: {type: quantum}
links:
  - {peer1: r1.0, peer2: r9.0, loss: 150, delay: -1}
  - {peer1: nonsense, peer2: r1.1, jitter: -2, rate: -3}
";
        let errors = TopologyFile::from_yaml(yaml).unwrap().check();
        let rendered = errors.join("\n");
        assert!(rendered.contains("unknown type \"quantum\""), "{rendered}");
        assert!(rendered.contains("unknown node r9"), "{rendered}");
        assert!(rendered.contains("loss 150"), "{rendered}");
        assert!(rendered.contains("delay -1"), "{rendered}");
        assert!(rendered.contains("not of the form"), "{rendered}");
        assert!(rendered.contains("jitter -2"), "{rendered}");
        assert!(rendered.contains("rate -3"), "{rendered}");
        assert_eq!(errors.len(), 7);
    }

    #[test]
    fn interface_reuse_is_rejected() {
        let yaml = "\
nodes:
  r1: {type: router}
  r2: {type: router}
  h1: {type: host}
links:
  - {peer1: r1.0, peer2: r2.0}
  - {peer1: r1.0, peer2: h1.0}
bridges:
  br0: {host: eth0, interfaces: [h1.0]}
";
        let errors = TopologyFile::from_yaml(yaml).unwrap().check();
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(errors[0].contains("h1.0 is used 2 times"), "{errors:?}");
        assert!(errors[1].contains("r1.0 is used 2 times"), "{errors:?}");
    }

    #[test]
    fn bridges_resolve_legs() {
        let yaml = "\
nodes:
  h1: {type: host}
  s1: {type: ovs}
bridges:
  br0: {host: eth0, interfaces: [h1.0, s1.3]}
  br1: {interfaces: []}
";
        let topology = TopologyFile::from_yaml(yaml).unwrap().validate().unwrap();
        assert_eq!(topology.bridges.len(), 2);
        assert_eq!(topology.bridges[0].host.as_deref(), Some("eth0"));
        assert_eq!(topology.bridges[0].legs.len(), 2);
        assert_eq!(topology.bridges[0].legs[1], Endpoint { node: "s1".into(), if_index: 3 });
        assert!(topology.bridges[1].host.is_none());
    }

    #[test]
    fn negative_interface_index_is_rejected() {
        let yaml = "\
nodes:
  r1: {type: router}
  r2: {type: router}
links:
  - {peer1: \"r1.-1\", peer2: r2.0}
";
        let errors = TopologyFile::from_yaml(yaml).unwrap().check();
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].contains("interface index -1 is negative"), "{errors:?}");
    }

    #[test]
    fn documents_round_trip_through_serde() {
        let file = TopologyFile::from_yaml(TWO_ROUTERS).unwrap();
        let rendered = serde_yaml::to_string(&file).unwrap();
        let reparsed = TopologyFile::from_yaml(&rendered).unwrap();
        assert!(reparsed.check().is_empty());
        assert_eq!(reparsed.links.len(), 1);
    }
}
