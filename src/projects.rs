// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Project name to path lookup.
//!
//! The registry itself belongs to the control plane; the daemon only needs
//! to resolve names and enumerate roots for orphan reconciliation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::ResolvedConfig;

/// Resolves project names to repository roots.
#[cfg_attr(test, mockall::automock)]
pub trait ProjectLookup: Send + Sync {
    /// Root of the named project, if known.
    fn resolve(&self, name: &str) -> Option<PathBuf>;

    /// Every registered project.
    fn all(&self) -> Vec<(String, PathBuf)>;
}

/// Lookup backed by the `projects` map and `projectsRoot` of the config.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredProjects {
    projects: BTreeMap<String, PathBuf>,
    projects_root: Option<PathBuf>,
}

impl ConfiguredProjects {
    pub fn new(projects: BTreeMap<String, PathBuf>, projects_root: Option<PathBuf>) -> Self {
        Self {
            projects,
            projects_root,
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(config.projects.clone(), config.projects_root.clone())
    }

    /// Register or replace a project.
    pub fn insert(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.projects.insert(name.into(), path.into());
    }
}

impl ProjectLookup for ConfiguredProjects {
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        if let Some(path) = self.projects.get(name) {
            return Some(path.clone());
        }
        if let Some((_, path)) = self
            .projects
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            return Some(path.clone());
        }

        // Only plain names may be looked up under the projects root
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return None;
        }
        let candidate = self.projects_root.as_ref()?.join(name);
        candidate.is_dir().then_some(candidate)
    }

    fn all(&self) -> Vec<(String, PathBuf)> {
        self.projects
            .iter()
            .map(|(name, path)| (name.clone(), path.clone()))
            .collect()
    }
}
