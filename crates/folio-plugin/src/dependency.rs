//! Dependency checks between installed plugins.
//!
//! Edges come from the constraints each installed plugin recorded when it
//! was installed, plus the candidate's freshly fetched constraints. Nothing
//! here installs anything; it only decides whether a change is allowed.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::PluginError;
use crate::registry::InstalledPlugin;
use crate::version::VersionConstraint;

/// Every declared dependency must be installed at a satisfying version.
pub fn check_dependencies(
    declared: &BTreeMap<String, String>,
    installed: &[InstalledPlugin],
) -> Result<(), PluginError> {
    for (dependency, raw) in declared {
        let constraint = VersionConstraint::parse(raw)?;
        let Some(found) = installed.iter().find(|p| &p.id == dependency) else {
            return Err(PluginError::UnsatisfiedDependency {
                dependency: dependency.clone(),
                reason: format!("not installed (requires {constraint})"),
            });
        };
        if !constraint.matches(&found.version) {
            return Err(PluginError::UnsatisfiedDependency {
                dependency: dependency.clone(),
                reason: format!("requires {constraint}, installed {}", found.version),
            });
        }
    }
    Ok(())
}

/// Installed plugins that depend on `plugin_id` must still be satisfied by `new_version`.
pub fn check_consumers(
    plugin_id: &str,
    new_version: &str,
    installed: &[InstalledPlugin],
) -> Result<(), PluginError> {
    for consumer in installed.iter().filter(|p| p.id != plugin_id) {
        let Some(raw) = consumer.dependencies.get(plugin_id) else {
            continue;
        };
        let constraint = VersionConstraint::parse(raw)?;
        if !constraint.matches(new_version) {
            return Err(PluginError::UnsatisfiedDependency {
                dependency: consumer.id.clone(),
                reason: format!(
                    "{} requires {plugin_id} {constraint}, which {new_version} does not satisfy",
                    consumer.id
                ),
            });
        }
    }
    Ok(())
}

/// A plugin cannot be removed while another installed plugin depends on it.
pub fn check_removal(plugin_id: &str, installed: &[InstalledPlugin]) -> Result<(), PluginError> {
    if let Some(consumer) = installed
        .iter()
        .find(|p| p.id != plugin_id && p.dependencies.contains_key(plugin_id))
    {
        return Err(PluginError::UnsatisfiedDependency {
            dependency: consumer.id.clone(),
            reason: format!("{} depends on {plugin_id}", consumer.id),
        });
    }
    Ok(())
}

/// Topologically sort the graph with `candidate`'s edges replaced by
/// `candidate_deps`; fail with the cycle if one exists.
pub fn check_acyclic(
    candidate: &str,
    candidate_deps: &BTreeMap<String, String>,
    installed: &[InstalledPlugin],
) -> Result<(), PluginError> {
    let mut graph: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for plugin in installed.iter().filter(|p| p.id != candidate) {
        graph
            .entry(plugin.id.as_str())
            .or_default()
            .extend(plugin.dependencies.keys().map(String::as_str));
    }
    graph
        .entry(candidate)
        .or_default()
        .extend(candidate_deps.keys().map(String::as_str));

    let targets: Vec<&str> = graph.values().flatten().copied().collect();
    for node in targets {
        graph.entry(node).or_default();
    }

    // Peel off nodes whose dependencies are all resolved.
    let mut pending: BTreeMap<&str, usize> =
        graph.iter().map(|(node, deps)| (*node, deps.len())).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (node, deps) in &graph {
        for dep in deps {
            dependents.entry(*dep).or_default().push(*node);
        }
    }
    let mut ready: VecDeque<&str> = pending
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut sorted = 0usize;
    while let Some(node) = ready.pop_front() {
        sorted += 1;
        for dependent in dependents.get(node).into_iter().flatten() {
            if let Some(n) = pending.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    ready.push_back(*dependent);
                }
            }
        }
    }
    if sorted == graph.len() {
        return Ok(());
    }

    // Every leftover node has an edge to another leftover node: walk until one repeats.
    let leftover: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(node, _)| *node)
        .collect();
    let start = if leftover.contains(candidate) {
        candidate
    } else {
        leftover.iter().next().copied().unwrap_or(candidate)
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = graph
            .get(current)
            .and_then(|deps| deps.iter().find(|d| leftover.contains(*d)).copied());
        let Some(next) = next else {
            return Err(PluginError::DependencyCycle(
                leftover.iter().map(|s| s.to_string()).collect(),
            ));
        };
        if let Some(pos) = path.iter().position(|n| *n == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return Err(PluginError::DependencyCycle(cycle));
        }
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{LicenseType, PluginDescriptor};

    fn installed(id: &str, version: &str, deps: &[(&str, &str)]) -> InstalledPlugin {
        let descriptor = PluginDescriptor {
            id: id.into(),
            name: id.into(),
            version: version.into(),
            author: None,
            description: None,
            license_type: LicenseType::Free,
            requires_platform_version: None,
            dependencies: deps
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            download_url: String::new(),
            signature: String::new(),
            changelog: None,
        };
        InstalledPlugin::from_descriptor(&descriptor, Default::default())
    }

    fn deps(list: &[(&str, &str)]) -> BTreeMap<String, String> {
        list.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // ── Declared dependencies ───────────────────────────────────────

    #[test]
    fn test_dependencies_satisfied() {
        let all = vec![installed("core-utils", "1.2.0", &[])];
        assert!(check_dependencies(&deps(&[("core-utils", ">=1.0.0")]), &all).is_ok());
        assert!(check_dependencies(&deps(&[("core-utils", "1.0.0")]), &all).is_ok());
        assert!(check_dependencies(&BTreeMap::new(), &[]).is_ok());
    }

    #[test]
    fn test_dependency_too_old() {
        let all = vec![installed("core-utils", "0.9.0", &[])];
        let err = check_dependencies(&deps(&[("core-utils", ">=1.0.0")]), &all).unwrap_err();
        match err {
            PluginError::UnsatisfiedDependency { dependency, reason } => {
                assert_eq!(dependency, "core-utils");
                assert!(reason.contains("0.9.0"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_dependency_missing() {
        let err = check_dependencies(&deps(&[("core-utils", "^1")]), &[]).unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }

    // ── Consumers ───────────────────────────────────────────────────

    #[test]
    fn test_consumer_blocks_incompatible_update() {
        let all = vec![
            installed("core-utils", "1.4.0", &[]),
            installed("seo-tools", "1.0.0", &[("core-utils", "^1.0")]),
        ];
        assert!(check_consumers("core-utils", "1.9.0", &all).is_ok());
        let err = check_consumers("core-utils", "2.0.0", &all).unwrap_err();
        assert!(matches!(
            err,
            PluginError::UnsatisfiedDependency { ref dependency, .. } if dependency == "seo-tools"
        ));
    }

    #[test]
    fn test_removal_blocked_by_consumer() {
        let all = vec![
            installed("core-utils", "1.0.0", &[]),
            installed("seo-tools", "1.0.0", &[("core-utils", ">=1.0.0")]),
        ];
        assert!(check_removal("seo-tools", &all).is_ok());
        let err = check_removal("core-utils", &all).unwrap_err();
        assert!(err.to_string().contains("seo-tools"));
    }

    // ── Cycles ──────────────────────────────────────────────────────

    #[test]
    fn test_acyclic_graph_passes() {
        let all = vec![
            installed("core-utils", "1.0.0", &[]),
            installed("media-kit", "1.0.0", &[("core-utils", "*")]),
        ];
        let candidate = deps(&[("core-utils", "*"), ("media-kit", "*")]);
        assert!(check_acyclic("seo-tools", &candidate, &all).is_ok());
    }

    #[test]
    fn test_two_node_cycle() {
        let all = vec![installed("core-utils", "1.0.0", &[("seo-tools", "*")])];
        let err = check_acyclic("seo-tools", &deps(&[("core-utils", "*")]), &all).unwrap_err();
        match err {
            PluginError::DependencyCycle(path) => {
                assert_eq!(path, vec!["seo-tools", "core-utils", "seo-tools"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = check_acyclic("seo-tools", &deps(&[("seo-tools", "*")]), &[]).unwrap_err();
        assert!(matches!(err, PluginError::DependencyCycle(_)));
    }

    #[test]
    fn test_candidate_edges_replace_recorded_ones() {
        // Installed seo-tools used to depend on media-kit; the new version does not.
        let all = vec![
            installed("seo-tools", "1.0.0", &[("media-kit", "*")]),
            installed("media-kit", "1.0.0", &[]),
        ];
        assert!(check_acyclic("seo-tools", &BTreeMap::new(), &all).is_ok());

        let all = vec![
            installed("seo-tools", "1.0.0", &[]),
            installed("media-kit", "1.0.0", &[("seo-tools", "*")]),
        ];
        let err = check_acyclic("seo-tools", &deps(&[("media-kit", "*")]), &all).unwrap_err();
        assert!(err.to_string().contains("seo-tools -> media-kit -> seo-tools"));
    }

    #[test]
    fn test_longer_cycle_not_through_candidate() {
        let all = vec![
            installed("a-one", "1.0.0", &[("b-two", "*")]),
            installed("b-two", "1.0.0", &[("c-three", "*")]),
            installed("c-three", "1.0.0", &[("a-one", "*")]),
        ];
        let err = check_acyclic("seo-tools", &BTreeMap::new(), &all).unwrap_err();
        match err {
            PluginError::DependencyCycle(path) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
