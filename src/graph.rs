//! Dependency graph over resource addresses.
//!
//! Nodes are addresses stored in an arena and referenced by index; edges run
//! from a dependency to its dependents. Ordering is a stable topological
//! sort in which ready nodes are taken in insertion (declaration) order.

use crate::config::Configuration;
use crate::schema::Diagnostic;
use crate::types::Address;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

/// A directed dependency graph.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<Address>,
    index: HashMap<Address, usize>,
    /// `dependents[i]` are the nodes that depend on node `i`.
    dependents: Vec<BTreeSet<usize>>,
    /// `dependencies[i]` are the nodes node `i` depends on.
    dependencies: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph of a configuration. Data sources come first, then
    /// resources, each in declaration order.
    ///
    /// An explicit `depends_on` naming an undeclared address is an error
    /// diagnostic; references to undeclared addresses are left to decoding.
    pub fn from_configuration(config: &Configuration) -> (Self, Vec<Diagnostic>) {
        let mut graph = Self::new();
        let mut diagnostics = Vec::new();
        for address in config.addresses() {
            graph.add_node(address);
        }

        for address in config.addresses() {
            let Some(decl) = config.get(&address) else {
                continue;
            };
            for raw in &decl.depends_on {
                match raw.parse::<Address>() {
                    Ok(dep) if graph.contains(&dep) => {},
                    Ok(dep) => diagnostics.push(
                        Diagnostic::error("Invalid depends_on")
                            .with_detail(format!("{address} depends on undeclared {dep}")),
                    ),
                    Err(e) => diagnostics.push(
                        Diagnostic::error("Invalid depends_on")
                            .with_detail(format!("{address}: {}", e.message())),
                    ),
                }
            }
            for dep in decl.dependencies().unwrap_or_default() {
                if graph.contains(&dep) {
                    graph.add_edge(&dep, &address);
                }
            }
        }
        (graph, diagnostics)
    }

    /// Add a node if absent, returning its index.
    pub fn add_node(&mut self, address: Address) -> usize {
        if let Some(&i) = self.index.get(&address) {
            return i;
        }
        let i = self.nodes.len();
        self.index.insert(address.clone(), i);
        self.nodes.push(address);
        self.dependents.push(BTreeSet::new());
        self.dependencies.push(BTreeSet::new());
        i
    }

    /// Record that `dependent` depends on `dependency`, adding either node
    /// if absent.
    pub fn add_edge(&mut self, dependency: &Address, dependent: &Address) {
        let from = self.add_node(dependency.clone());
        let to = self.add_node(dependent.clone());
        self.dependents[from].insert(to);
        self.dependencies[to].insert(from);
    }

    /// Returns `true` if the address is a node.
    pub fn contains(&self, address: &Address) -> bool {
        self.index.contains_key(address)
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> &[Address] {
        &self.nodes
    }

    /// Direct dependencies of `address`, in insertion order.
    pub fn dependencies(&self, address: &Address) -> Vec<Address> {
        self.neighbours(address, &self.dependencies)
    }

    /// Direct dependents of `address`, in insertion order.
    pub fn dependents(&self, address: &Address) -> Vec<Address> {
        self.neighbours(address, &self.dependents)
    }

    fn neighbours(&self, address: &Address, table: &[BTreeSet<usize>]) -> Vec<Address> {
        self.index
            .get(address)
            .map(|&i| table[i].iter().map(|&j| self.nodes[j].clone()).collect())
            .unwrap_or_default()
    }

    /// Every node reachable by following dependent edges from `address`.
    pub fn transitive_dependents(&self, address: &Address) -> Vec<Address> {
        let Some(&start) = self.index.get(address) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            for &j in &self.dependents[i] {
                if seen.insert(j) {
                    stack.push(j);
                }
            }
        }
        seen.into_iter().map(|j| self.nodes[j].clone()).collect()
    }

    /// Stable topological order: dependencies before dependents, ties broken
    /// by insertion order. A cycle is an error diagnostic naming its members.
    pub fn topological_order(&self) -> Result<Vec<Address>, Diagnostic> {
        let mut indegree: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(self.nodes[i].clone());
            for &j in &self.dependents[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.push(Reverse(j));
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            let members = indegree
                .iter()
                .enumerate()
                .filter(|&(_, &d)| d > 0)
                .map(|(i, _)| self.nodes[i].to_string())
                .collect::<Vec<_>>()
                .join(", ");
            Err(Diagnostic::error("Dependency cycle").with_detail(format!(
                "these resources depend on each other: {members}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(name: &str) -> Address {
        Address::managed("linode_x", name)
    }

    #[test]
    fn test_order_respects_edges_and_declaration() {
        let mut g = DependencyGraph::new();
        for name in ["c", "b", "a", "d"] {
            g.add_node(addr(name));
        }
        g.add_edge(&addr("a"), &addr("c"));
        g.add_edge(&addr("b"), &addr("a"));

        let order = g.topological_order().unwrap();
        assert_eq!(order, vec![addr("b"), addr("a"), addr("c"), addr("d")]);
        assert_eq!(g.transitive_dependents(&addr("b")), vec![addr("c"), addr("a")]);
        assert_eq!(g.dependencies(&addr("c")), vec![addr("a")]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut g = DependencyGraph::new();
        g.add_node(addr("free"));
        g.add_edge(&addr("a"), &addr("b"));
        g.add_edge(&addr("b"), &addr("a"));
        let diag = g.topological_order().unwrap_err();
        assert!(diag.is_error());
        assert_eq!(diag.summary, "Dependency cycle");
        let detail = diag.detail.unwrap();
        assert!(detail.contains("linode_x.a") && detail.contains("linode_x.b"));
        assert!(!detail.contains("free"));
    }

    #[test]
    fn test_from_configuration() {
        let config = Configuration::from_json_str(
            r#"{
                "data_sources": [{"kind": "linode_images", "name": "all"}],
                "resources": [
                    {"kind": "linode_x", "name": "app",
                     "attributes": {"image": "${data.linode_images.all.images.0.id}",
                                    "db": "${linode_x.db.host}"}},
                    {"kind": "linode_x", "name": "db", "depends_on": ["linode_x.missing"]}
                ]
            }"#,
        )
        .unwrap();
        let (g, diags) = DependencyGraph::from_configuration(&config);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].summary, "Invalid depends_on");

        let order = g.topological_order().unwrap();
        assert_eq!(
            order,
            vec![
                Address::data("linode_images", "all"),
                addr("db"),
                addr("app"),
            ]
        );
    }
}
