//! Dependency resolution
//!
//! Checks a candidate plugin's declared constraints against the plugins that
//! are currently installed *and enabled*, and detects dependency cycles
//! across a to-be-installed set before any state is mutated.

use crate::error::{DependencyError, PluginResult};
use crate::manifest::PluginMetadata;
use folio_core::domain::plugin::{DependencySpec, Plugin};
use std::collections::HashMap;

fn dep_ids(deps: &[DependencySpec]) -> Vec<&str> {
    deps.iter().map(|d| d.plugin_id.as_str()).collect()
}

/// Stateless dependency checker
#[derive(Debug, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Verify every declared dependency is satisfied by an installed and
    /// enabled plugin. Fail-fast on the first unsatisfied constraint.
    pub fn check_dependencies(
        &self,
        metadata: &PluginMetadata,
        installed: &[Plugin],
    ) -> PluginResult<()> {
        let by_id: HashMap<&str, &Plugin> =
            installed.iter().map(|p| (p.id.as_str(), p)).collect();

        for dep in &metadata.dependencies {
            let candidate = by_id
                .get(dep.plugin_id.as_str())
                .filter(|p| p.is_installed && p.is_enabled)
                .ok_or_else(|| DependencyError::Missing(dep.plugin_id.clone()))?;

            if !dep.constraint.satisfies(candidate.version) {
                return Err(DependencyError::VersionConflict {
                    id: dep.plugin_id.clone(),
                    installed: candidate.version.to_string(),
                    required: dep.constraint.to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Detect cycles across the to-be-installed set plus what is already
    /// installed. Runs before any install commits, so a detected cycle
    /// leaves the graph untouched.
    pub fn check_install_set(
        &self,
        candidates: &[&PluginMetadata],
        installed: &[Plugin],
    ) -> PluginResult<()> {
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();

        for meta in candidates {
            edges.insert(meta.id.as_str(), dep_ids(&meta.dependencies));
        }
        for plugin in installed {
            // A candidate re-install supersedes the installed record
            edges
                .entry(plugin.id.as_str())
                .or_insert_with(|| dep_ids(&plugin.dependencies));
        }

        // Iterative DFS with tri-color marking; missing nodes are not an
        // error here, they surface as DependencyMissing in the per-plugin
        // constraint check.
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for &start in edges.keys() {
            if marks.contains_key(start) {
                continue;
            }

            let mut path: Vec<&str> = Vec::new();
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];

            while let Some((node, next_child)) = stack.pop() {
                if next_child == 0 {
                    marks.insert(node, Mark::InProgress);
                    path.push(node);
                }

                let children = edges.get(node).map(Vec::as_slice).unwrap_or(&[]);
                if next_child < children.len() {
                    stack.push((node, next_child + 1));
                    let child = children[next_child];
                    match marks.get(child) {
                        Some(Mark::InProgress) => {
                            let cycle_start =
                                path.iter().position(|&n| n == child).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[cycle_start..].iter().map(|s| s.to_string()).collect();
                            cycle.push(child.to_string());
                            return Err(DependencyError::Cycle(cycle).into());
                        }
                        Some(Mark::Done) => {}
                        None => {
                            if edges.contains_key(child) {
                                stack.push((child, 0));
                            }
                        }
                    }
                } else {
                    marks.insert(node, Mark::Done);
                    path.pop();
                }
            }
        }

        Ok(())
    }
}
