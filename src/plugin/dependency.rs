//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Eagle.
//! The Eagle project belongs to the Dunimd Team.
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! You may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//!     http://www.apache.org/licenses/LICENSE-2.0
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

//! Plugin dependency graph.
//!
//! Edges point from a plugin to the plugins it depends on. Cycle searches
//! use three-colour depth-first marking; a back edge to an in-progress node
//! yields the cycle as a closed path such as `[A, B, C, A]`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::errors::{EgError, Result};
use crate::plugin::metadata::EgPluginMetadata;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EgMark {
    InProgress,
    Done,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EgDependencyGraph {
    edges: BTreeMap<String, Vec<String>>,
}

impl EgDependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_metadata<'a, I>(metadata: I) -> Self
    where
        I: IntoIterator<Item = &'a EgPluginMetadata>,
    {
        let mut graph = Self::new();
        for meta in metadata {
            graph.add_node(meta.plugin_id.clone(), meta.dependencies.clone());
        }
        graph
    }

    pub fn add_node(&mut self, plugin_id: impl Into<String>, dependencies: Vec<String>) {
        self.edges.insert(plugin_id.into(), dependencies);
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.edges.contains_key(plugin_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    pub fn dependencies_of(&self, plugin_id: &str) -> &[String] {
        self.edges
            .get(plugin_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Direct dependencies of `plugin_id` that have no node.
    pub fn missing_dependencies(&self, plugin_id: &str) -> Vec<String> {
        self.dependencies_of(plugin_id)
            .iter()
            .filter(|dep| !self.contains(dep))
            .cloned()
            .collect()
    }

    /// Plugins that list `plugin_id` as a direct dependency.
    pub fn dependents_of(&self, plugin_id: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == plugin_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// First cycle reachable from `start`.
    pub fn find_cycle_from(&self, start: &str) -> Option<Vec<String>> {
        let mut marks = HashMap::new();
        let mut stack = Vec::new();
        self._visit(start, &mut marks, &mut stack)
    }

    fn _visit<'a>(
        &'a self,
        node: &'a str,
        marks: &mut HashMap<&'a str, EgMark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, EgMark::InProgress);
        stack.push(node);
        for dep in self.dependencies_of(node) {
            match marks.get(dep.as_str()) {
                Some(EgMark::Done) => {}
                Some(EgMark::InProgress) => {
                    let start = stack.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                None => {
                    if let Some(cycle) = self._visit(dep, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
        stack.pop();
        marks.insert(node, EgMark::Done);
        None
    }

    /// Every distinct cycle found by searching from each node. Each cycle is
    /// rotated to start at its smallest id.
    pub fn find_all_cycles(&self) -> Vec<Vec<String>> {
        let mut seen: BTreeSet<Vec<String>> = BTreeSet::new();
        for node in self.edges.keys() {
            if let Some(mut cycle) = self.find_cycle_from(node) {
                cycle.pop();
                if let Some(min_pos) = cycle
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1.cmp(b.1))
                    .map(|(idx, _)| idx)
                {
                    cycle.rotate_left(min_pos);
                }
                if let Some(first) = cycle.first().cloned() {
                    cycle.push(first);
                }
                seen.insert(cycle);
            }
        }
        seen.into_iter().collect()
    }

    /// Transitive dependencies of `plugin_id` followed by the plugin itself,
    /// dependencies first.
    pub fn load_order(&self, plugin_id: &str) -> Result<Vec<String>> {
        if !self.contains(plugin_id) {
            return Err(EgError::not_found("plugin", plugin_id));
        }
        if let Some(cycle) = self.find_cycle_from(plugin_id) {
            return Err(EgError::dependency(
                plugin_id,
                format!("circular dependency: {}", cycle.join(" -> ")),
            ));
        }
        let mut order = Vec::new();
        let mut visited = BTreeSet::new();
        self._post_order(plugin_id, &mut visited, &mut order)?;
        Ok(order)
    }

    fn _post_order(
        &self,
        node: &str,
        visited: &mut BTreeSet<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if !visited.insert(node.to_string()) {
            return Ok(());
        }
        for dep in self.dependencies_of(node) {
            if !self.contains(dep) {
                return Err(EgError::dependency(
                    node,
                    format!("missing dependency '{}'", dep),
                ));
            }
            self._post_order(dep, visited, order)?;
        }
        order.push(node.to_string());
        Ok(())
    }
}
