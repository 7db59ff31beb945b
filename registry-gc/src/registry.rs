// Copyright 2018 Alex Crawford
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Registry driver: translates the v1 registry's key layout into object
//! store operations.
//!
//! All images, repositories, and tags live under a single configured root
//! prefix. Enumeration follows the object store's `NextMarker` pagination
//! and dedupes within a call — registries are not guaranteed to return
//! sorted, unique listings.

use crate::errors::GcError;
use crate::object_store::ObjectStoreClient;
use itertools::Itertools;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Cheaply `Clone`-able: the scanner hands an owned copy to every spawned
/// worker task rather than threading a borrow through `tokio::spawn`'s
/// `'static` bound.
#[derive(Clone)]
pub struct RegistryDriver {
    store: Arc<ObjectStoreClient>,
    root: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    pub created: String,
    #[serde(rename = "Size", default)]
    pub size: u64,
    #[serde(default)]
    pub container_config: ContainerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RepositoryIndexEntry {
    id: String,
}

impl RegistryDriver {
    pub fn new(store: Arc<ObjectStoreClient>, root: &str) -> Self {
        RegistryDriver {
            store,
            root: root.trim_end_matches('/').to_string(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}/{}", self.root, suffix)
    }

    /// Enumerate every image id under `<root>/images/`, invoking `emit`
    /// once per previously-unseen id.
    pub async fn enumerate_images(&self, mut emit: impl FnMut(String)) -> Result<(), GcError> {
        let prefix = self.key("images/");
        let page = self.store.list_all(&prefix, Some("/")).await?;
        page.common_prefixes
            .into_iter()
            .map(|common_prefix| {
                common_prefix
                    .trim_start_matches(&prefix)
                    .trim_end_matches('/')
                    .to_string()
            })
            .filter(|id| !id.is_empty())
            .unique()
            .for_each(&mut emit);
        Ok(())
    }

    /// Enumerate every repository name under `<root>/repositories/library/`.
    pub async fn enumerate_repositories(&self, mut emit: impl FnMut(String)) -> Result<(), GcError> {
        let prefix = self.key("repositories/library/");
        let page = self.store.list_all(&prefix, Some("/")).await?;
        page.common_prefixes
            .into_iter()
            .map(|common_prefix| {
                common_prefix
                    .trim_start_matches(&prefix)
                    .trim_end_matches('/')
                    .to_string()
            })
            .filter(|repo| !repo.is_empty())
            .unique()
            .for_each(&mut emit);
        Ok(())
    }

    /// `[id, parent, grandparent, ...]`, head first. The scanner is
    /// responsible for checking that the first element equals `id`.
    pub async fn get_image_ancestry(&self, id: &str) -> Result<Vec<String>, GcError> {
        let body = self
            .store
            .get(&self.key(&format!("images/{}/ancestry", id)))
            .await?;
        serde_json::from_slice(&body).map_err(|err| GcError::Parse(err.to_string()))
    }

    pub async fn get_image_info(&self, id: &str) -> Result<ImageInfo, GcError> {
        let body = self.store.get(&self.key(&format!("images/{}/json", id))).await?;
        serde_json::from_slice(&body).map_err(|err| GcError::Parse(err.to_string()))
    }

    /// The set of layer ids a repository claims as its own.
    pub async fn get_repository_index(&self, repo: &str) -> Result<Vec<String>, GcError> {
        let key = self.key(&format!("repositories/library/{}/_index_images", repo));
        let body = self.store.get(&key).await?;
        let entries: Vec<RepositoryIndexEntry> =
            serde_json::from_slice(&body).map_err(|err| GcError::Parse(err.to_string()))?;
        Ok(entries.into_iter().map(|e| e.id).collect())
    }

    /// `{tag name -> head layer id}`, parsed from `tag_<name>` keys whose
    /// body is the head layer id as a quoted JSON string.
    pub async fn get_repository_tags(&self, repo: &str) -> Result<HashMap<String, String>, GcError> {
        let prefix = self.key(&format!("repositories/library/{}/tag_", repo));
        let page = self.store.list_all(&prefix, None).await?;
        let mut tags = HashMap::new();
        for key in page.contents {
            let name = match key.strip_prefix(prefix.as_str()) {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => continue,
            };
            let body = self.store.get(&key).await?;
            let raw = String::from_utf8_lossy(&body);
            let head = raw.trim().trim_matches('"').to_string();
            tags.insert(name, head);
        }
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_root_and_slash_from_enumerated_prefixes() {
        let prefix = "registry/images/";
        let common = "registry/images/abc123/";
        let id = common.trim_start_matches(prefix).trim_end_matches('/');
        assert_eq!(id, "abc123");
    }

    #[test]
    fn tag_body_quotes_are_stripped() {
        let raw = "\"abc123\"\n";
        let head = raw.trim().trim_matches('"');
        assert_eq!(head, "abc123");
    }

    #[test]
    fn image_info_parses_optional_fields() {
        let json = r#"{"created":"2020-01-01T00:00:00Z","Size":42,"container_config":{"Cmd":["/bin/sh","-c","true"]}}"#;
        let info: ImageInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.size, 42);
        assert_eq!(
            info.container_config.cmd,
            Some(vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()])
        );
    }

    #[test]
    fn image_info_defaults_missing_optional_fields() {
        let json = r#"{"created":"2020-01-01T00:00:00Z"}"#;
        let info: ImageInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.size, 0);
        assert!(info.container_config.cmd.is_none());
    }
}
