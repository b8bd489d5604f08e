use std::collections::{HashSet, VecDeque};

use indexmap::{IndexMap, IndexSet};
use snafu::Snafu;

use super::ServiceName;

#[derive(Debug, Snafu, Eq, PartialEq)]
#[snafu(context(suffix(false)))]
pub enum GraphError {
    #[snafu(display("duplicate service '{}'", service))]
    DuplicateService { service: ServiceName },
    #[snafu(display("service '{}' depends on undeclared service '{}'", service, dependency))]
    UnknownDependency { service: ServiceName, dependency: String },
    #[snafu(display("dependency cycle detected: {}", render_path(path)))]
    Cycle { path: Vec<ServiceName> },
}

fn render_path(path: &[ServiceName]) -> String {
    path.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" -> ")
}

/// Service dependency graph.
///
/// Edges point from a service to the services it depends on. Services are kept in declaration order, which is used to
/// break ties when linearizing the graph.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: IndexMap<ServiceName, IndexSet<String>>,
}

impl DependencyGraph {
    /// Adds a service along with the names of the services it depends on.
    ///
    /// Dependencies may refer to services that have not been added yet; they are only checked by
    /// [`validate`][Self::validate].
    pub fn add_service<I, S>(&mut self, service: ServiceName, dependencies: I) -> Result<(), GraphError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.nodes.contains_key(&service) {
            return Err(GraphError::DuplicateService { service });
        }

        self.nodes
            .insert(service, dependencies.into_iter().map(Into::into).collect());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.nodes.contains_key(service)
    }

    /// Direct dependencies of `service`, in declaration order.
    pub fn dependencies<'a>(&'a self, service: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.nodes
            .get(service)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Direct dependents of `service`, in declaration order.
    pub fn dependents<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a ServiceName> + 'a {
        self.nodes
            .iter()
            .filter(move |(_, deps)| deps.contains(service))
            .map(|(name, _)| name)
    }

    /// Every service that depends on `service`, directly or indirectly, in declaration order.
    pub fn transitive_dependents(&self, service: &str) -> Vec<ServiceName> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(service);

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current) {
                if seen.insert(dependent.as_str()) {
                    queue.push_back(dependent.as_str());
                }
            }
        }

        self.nodes
            .keys()
            .filter(|name| seen.contains(name.as_str()))
            .cloned()
            .collect()
    }

    /// Every service `service` depends on, directly or indirectly, in declaration order.
    pub fn transitive_dependencies(&self, service: &str) -> Vec<ServiceName> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(service);

        while let Some(current) = queue.pop_front() {
            for dependency in self.dependencies(current) {
                if seen.insert(dependency) {
                    queue.push_back(dependency);
                }
            }
        }

        self.nodes
            .keys()
            .filter(|name| seen.contains(name.as_str()))
            .cloned()
            .collect()
    }

    /// Checks that every dependency is declared and that the graph is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.check_dependencies_exist()?;
        self.check_for_cycles()
    }

    /// Linearizes the graph so that every service comes after all of its dependencies.
    ///
    /// Among the services whose dependencies are all placed, the one declared first is placed next.
    pub fn activation_order(&self) -> Result<Vec<ServiceName>, GraphError> {
        self.validate()?;

        let mut placed: HashSet<&str> = HashSet::with_capacity(self.nodes.len());
        let mut order = Vec::with_capacity(self.nodes.len());
        while order.len() < self.nodes.len() {
            let next = self.nodes.iter().find(|(name, deps)| {
                !placed.contains(name.as_str()) && deps.iter().all(|dep| placed.contains(dep.as_str()))
            });

            match next {
                Some((name, _)) => {
                    placed.insert(name.as_str());
                    order.push(name.clone());
                }
                None => {
                    let path = self
                        .nodes
                        .keys()
                        .filter(|name| !placed.contains(name.as_str()))
                        .cloned()
                        .collect();
                    return Err(GraphError::Cycle { path });
                }
            }
        }

        Ok(order)
    }

    fn check_dependencies_exist(&self) -> Result<(), GraphError> {
        for (service, deps) in &self.nodes {
            if let Some(missing) = deps.iter().find(|dep| !self.nodes.contains_key(dep.as_str())) {
                return Err(GraphError::UnknownDependency {
                    service: service.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        Ok(())
    }

    fn check_for_cycles(&self) -> Result<(), GraphError> {
        let mut finished = HashSet::new();

        // Depth-first search from every service, tracking the current path so a back edge can be reported as the cycle
        // it closes.
        for root in self.nodes.keys() {
            if finished.contains(root.as_str()) {
                continue;
            }

            let mut path: IndexSet<&str> = IndexSet::new();
            let mut traversal: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            path.insert(root.as_str());

            while let Some(&(node, next)) = traversal.last() {
                let dep = self.nodes.get(node).and_then(|deps| deps.get_index(next));
                match dep {
                    Some(dep) => {
                        if let Some(top) = traversal.last_mut() {
                            top.1 += 1;
                        }

                        if let Some(start) = path.get_index_of(dep.as_str()) {
                            let mut cycle = path
                                .iter()
                                .skip(start)
                                .filter_map(|name| self.nodes.get_key_value(*name).map(|(k, _)| k.clone()))
                                .collect::<Vec<_>>();
                            if let Some((first, _)) = self.nodes.get_key_value(dep.as_str()) {
                                cycle.push(first.clone());
                            }
                            return Err(GraphError::Cycle { path: cycle });
                        }

                        if !finished.contains(dep.as_str()) && self.nodes.contains_key(dep.as_str()) {
                            path.insert(dep.as_str());
                            traversal.push((dep.as_str(), 0));
                        }
                    }
                    None => {
                        // Every dependency of this node has been explored.
                        finished.insert(node);
                        path.pop();
                        traversal.pop();
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    impl DependencyGraph {
        fn with_service(&mut self, name: &str, deps: &[&str]) -> &mut Self {
            let name = ServiceName::try_from(name).expect("invalid test service name");
            self.add_service(name, deps.iter().copied()).expect("duplicate test service");
            self
        }
    }

    fn names(names: &[&str]) -> Vec<ServiceName> {
        names.iter().map(|n| ServiceName::try_from(*n).unwrap()).collect()
    }

    #[test]
    fn store_stack_order() {
        let mut graph = DependencyGraph::default();
        graph
            .with_service("web", &["db", "redis"])
            .with_service("worker", &["db", "redis", "web"])
            .with_service("db", &[])
            .with_service("redis", &[]);

        assert_eq!(graph.activation_order(), Ok(names(&["db", "redis", "web", "worker"])));
    }

    #[test]
    fn ties_broken_by_declaration_order() {
        let mut graph = DependencyGraph::default();
        graph
            .with_service("c", &[])
            .with_service("a", &[])
            .with_service("b", &["c"])
            .with_service("d", &["a"]);

        assert_eq!(graph.activation_order(), Ok(names(&["c", "a", "b", "d"])));
    }

    #[test]
    fn diamond() {
        let mut graph = DependencyGraph::default();
        graph
            .with_service("top", &["left", "right"])
            .with_service("left", &["bottom"])
            .with_service("right", &["bottom"])
            .with_service("bottom", &[]);

        assert_eq!(
            graph.activation_order(),
            Ok(names(&["bottom", "left", "right", "top"]))
        );
        assert_eq!(graph.transitive_dependents("bottom"), names(&["top", "left", "right"]));
        assert_eq!(graph.dependents("left").cloned().collect::<Vec<_>>(), names(&["top"]));
        assert_eq!(graph.dependencies("top").collect::<Vec<_>>(), vec!["left", "right"]);
        assert_eq!(graph.transitive_dependencies("top"), names(&["left", "right", "bottom"]));
        assert!(graph.transitive_dependencies("bottom").is_empty());
    }

    #[test]
    fn unknown_dependency() {
        let mut graph = DependencyGraph::default();
        graph.with_service("web", &["db", "cache"]).with_service("db", &[]);

        assert_eq!(
            graph.validate(),
            Err(GraphError::UnknownDependency {
                service: ServiceName::try_from("web").unwrap(),
                dependency: "cache".to_string(),
            })
        );
    }

    #[test]
    fn duplicate_service() {
        let mut graph = DependencyGraph::default();
        graph.with_service("web", &[]);

        let result = graph.add_service(ServiceName::try_from("web").unwrap(), Vec::<String>::new());
        assert!(matches!(result, Err(GraphError::DuplicateService { .. })));
    }

    #[test]
    fn detect_cycles() {
        let mut graph = DependencyGraph::default();
        graph
            .with_service("one", &["three"])
            .with_service("two", &["one"])
            .with_service("three", &["two"])
            .with_service("four", &["three"]);

        assert_eq!(
            graph.activation_order(),
            Err(GraphError::Cycle {
                path: names(&["one", "three", "two", "one"]),
            })
        );

        let mut graph = DependencyGraph::default();
        graph.with_service("ok", &[]).with_service("selfish", &["selfish"]);

        assert_eq!(
            graph.validate(),
            Err(GraphError::Cycle {
                path: names(&["selfish", "selfish"]),
            })
        );
    }

    #[test]
    fn cycle_display() {
        let err = GraphError::Cycle {
            path: names(&["a", "b", "a"]),
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    fn arb_dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
        (1usize..12).prop_flat_map(|n| (Just(n), prop::collection::vec((0..n, 0..n), 0..40)))
    }

    // Services are declared in reverse index order, and a service may only depend on services with a lower index, so
    // every generated graph is acyclic while declaration order never lines up with dependency order.
    fn build_dag(n: usize, edges: &[(usize, usize)]) -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        for i in (0..n).rev() {
            let deps = edges
                .iter()
                .filter(|(a, b)| a.max(b) == &i && a != b)
                .map(|(a, b)| format!("s{}", a.min(b)))
                .collect::<Vec<_>>();
            graph
                .add_service(ServiceName::try_from(format!("s{}", i)).unwrap(), deps)
                .unwrap();
        }
        graph
    }

    proptest! {
        #[test]
        fn activation_order_respects_every_edge((n, edges) in arb_dag()) {
            let graph = build_dag(n, &edges);
            let order = graph.activation_order().unwrap();
            prop_assert_eq!(order.len(), n);

            let position = |name: &str| order.iter().position(|s| s.as_str() == name).unwrap();
            for i in 0..n {
                let service = format!("s{}", i);
                for dep in graph.dependencies(&service) {
                    prop_assert!(position(dep) < position(&service));
                }
            }
        }

        #[test]
        fn closing_a_chain_is_always_a_cycle(len in 1usize..10, (n, edges) in arb_dag()) {
            let mut graph = build_dag(n, &edges);
            for i in 0..len {
                let deps = if i + 1 < len { vec![format!("c{}", i + 1)] } else { vec!["c0".to_string()] };
                graph.add_service(ServiceName::try_from(format!("c{}", i)).unwrap(), deps).unwrap();
            }

            let result = graph.activation_order();
            let is_cycle = matches!(result, Err(GraphError::Cycle { .. }));
            prop_assert!(is_cycle);
        }
    }
}
