//! Kit Store (§4.A) — validate and persist uploaded kit archives under
//! `owner/kit_id/version`.

pub mod archive;
pub mod manifest;
pub mod version;

pub use manifest::Kit;

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub struct KitStore {
    base_path: PathBuf,
}

/// Registry-fetch response contract (§4.A): `{ downloadUrl, kitConfig }`.
#[derive(Debug, Deserialize)]
struct RegistryResolveResponse {
    #[serde(rename = "downloadUrl")]
    download_url: String,
    #[allow(dead_code)]
    #[serde(rename = "kitConfig", default)]
    kit_config: Option<serde_json::Value>,
}

impl KitStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn version_dir(&self, owner: &str, kit_id: &str, version: &str) -> PathBuf {
        self.base_path.join(owner).join(kit_id).join(version)
    }

    fn manifest_path(dir: &Path) -> PathBuf {
        dir.join("kit.yaml")
    }

    /// Validates and persists an uploaded archive. Fails with
    /// `VersionExists` unless `overwrite` is set, `MalformedKit` on schema
    /// or layout problems, `InvalidVersion` on a non-strict version string.
    pub fn upload(&self, archive_bytes: &[u8], overwrite: bool) -> Result<Kit> {
        let stage_dir = self.base_path.join(format!(
            ".stage-{}",
            crate::util::generate_readable_uid("upload")
        ));
        archive::extract(archive_bytes, &stage_dir)?;

        let result = self.finish_upload(&stage_dir, overwrite);
        let _ = fs::remove_dir_all(&stage_dir);
        result
    }

    fn finish_upload(&self, stage_dir: &Path, overwrite: bool) -> Result<Kit> {
        let manifest_path = Self::manifest_path(stage_dir);
        let bytes = fs::read(&manifest_path).map_err(|_| {
            CoreError::MalformedKit(format!("archive has no top-level kit.yaml ({manifest_path:?})"))
        })?;
        let raw = manifest::RawManifest::parse(&bytes)?;

        let final_dir = self.version_dir(&raw.owner, &raw.id, &raw.version);
        if final_dir.exists() {
            if !overwrite {
                return Err(CoreError::VersionExists {
                    owner: raw.owner,
                    kit_id: raw.id,
                    version: raw.version,
                });
            }
            fs::remove_dir_all(&final_dir)
                .map_err(|e| CoreError::MalformedKit(format!("overwrite cleanup: {e}")))?;
        }

        let parent = final_dir.parent().expect("version_dir has owner/kit parents");
        fs::create_dir_all(parent)
            .map_err(|e| CoreError::MalformedKit(format!("failed to create {parent:?}: {e}")))?;

        // Stage-then-rename so a crash mid-copy never leaves a partial,
        // apparently-valid kit directory behind.
        let pre_final = stage_dir.to_path_buf();
        fs::rename(&pre_final, &final_dir).map_err(|e| {
            CoreError::MalformedKit(format!("failed to finalize kit directory: {e}"))
        })?;

        manifest::Kit::resolve(raw, final_dir)
    }

    /// `get_kit_config` for the Kit Store's own callers (§4.C calls through
    /// the Module Registry instead, but ingestion/listing need this too).
    pub fn get(&self, owner: &str, kit_id: &str, version: &str) -> Result<Kit> {
        let dir = self.version_dir(owner, kit_id, version);
        let manifest_path = Self::manifest_path(&dir);
        let bytes = fs::read(&manifest_path).map_err(|_| CoreError::KitNotFound {
            owner: owner.to_string(),
            kit_id: kit_id.to_string(),
            version: version.to_string(),
        })?;
        let raw = manifest::RawManifest::parse(&bytes)?;
        manifest::Kit::resolve(raw, dir)
    }

    /// Lists versions for `(owner, kit_id)`, sorted by numeric tuple
    /// (§4.A "version listing sorts lexically by numeric tuple").
    pub fn list_versions(&self, owner: &str, kit_id: &str) -> Result<Vec<String>> {
        let dir = self.base_path.join(owner).join(kit_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut versions: Vec<String> = fs::read_dir(&dir)
            .map_err(|e| CoreError::DbError(e.to_string()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| version::validate(name).is_ok())
            .collect();
        versions.sort_by_key(|v| version::as_tuple(v).expect("pre-filtered valid"));
        Ok(versions)
    }

    /// Removes a version directory, then its now-possibly-empty parent
    /// `kit_id` and `owner` directories (§4.A "deletion removes empty
    /// parent directories").
    ///
    /// Callers (the Module Registry) are responsible for refusing deletion
    /// while any module still references this kit (§3 invariant); this
    /// store performs the filesystem removal only.
    pub fn delete(&self, owner: &str, kit_id: &str, version: &str) -> Result<()> {
        let dir = self.version_dir(owner, kit_id, version);
        if !dir.is_dir() {
            return Err(CoreError::KitNotFound {
                owner: owner.to_string(),
                kit_id: kit_id.to_string(),
                version: version.to_string(),
            });
        }
        fs::remove_dir_all(&dir).map_err(|e| CoreError::DbError(e.to_string()))?;

        let kit_dir = dir.parent().expect("version has kit_id parent");
        if fs::read_dir(kit_dir).map(|mut d| d.next().is_none()).unwrap_or(false) {
            let _ = fs::remove_dir(kit_dir);
            let owner_dir = kit_dir.parent().expect("kit_id has owner parent");
            if fs::read_dir(owner_dir).map(|mut d| d.next().is_none()).unwrap_or(false) {
                let _ = fs::remove_dir(owner_dir);
            }
        }
        Ok(())
    }

    /// Downloads a kit from the configured registry and ingests it
    /// (§4.A "registry-fetch operation clones a kit by HTTP download").
    pub async fn fetch_from_registry(
        &self,
        registry_url: &str,
        owner: &str,
        kit_id: &str,
        version: &str,
        overwrite: bool,
    ) -> Result<Kit> {
        let client = reqwest::Client::new();
        let resolve_url =
            format!("{registry_url}/kits/{owner}/{kit_id}/{version}/resolve");
        let resolved: RegistryResolveResponse = client
            .get(&resolve_url)
            .send()
            .await
            .map_err(|e| CoreError::RegistryError(e.to_string()))?
            .error_for_status()
            .map_err(|e| CoreError::RegistryError(e.to_string()))?
            .json()
            .await
            .map_err(|e| CoreError::RegistryError(format!("malformed registry response: {e}")))?;

        let archive_bytes = client
            .get(&resolved.download_url)
            .send()
            .await
            .map_err(|e| CoreError::RegistryError(e.to_string()))?
            .error_for_status()
            .map_err(|e| CoreError::RegistryError(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| CoreError::RegistryError(e.to_string()))?;

        self.upload(&archive_bytes, overwrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_test_archive(owner: &str, kit_id: &str, version: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options: zip::write::FileOptions<()> = zip::write::FileOptions::default();

            let manifest = format!(
                "docVersion: \"v1\"\nid: {kit_id}\nowner: {owner}\nversion: {version}\nname: Hello Kit\nimage: python:3.12-slim\nagents:\n  - name: greeter\n    class: Greeter\nprofiles:\n  greet:\n    agent: greeter\n    actions:\n      - path: \"tools.py:say_hello\"\n        name: say_hello\n"
            );
            writer.start_file("kit.yaml", options).unwrap();
            writer.write_all(manifest.as_bytes()).unwrap();

            writer.start_file("actions/tools.py", options).unwrap();
            writer
                .write_all(b"def say_hello(name: str) -> str:\n    return f'hi {name}'\n")
                .unwrap();

            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn uploads_and_round_trips_a_kit() {
        let dir = tempfile::tempdir().unwrap();
        let store = KitStore::new(dir.path().to_path_buf());
        let archive = build_test_archive("acme", "hello", "1.0.0");

        let kit = store.upload(&archive, false).unwrap();
        assert_eq!(kit.owner, "acme");
        assert_eq!(kit.kit_id, "hello");
        assert_eq!(kit.semver, "1.0.0");
        assert!(kit.profiles.contains_key("greet"));

        let fetched = store.get("acme", "hello", "1.0.0").unwrap();
        assert_eq!(fetched.name, "Hello Kit");
    }

    #[test]
    fn rejects_duplicate_version_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = KitStore::new(dir.path().to_path_buf());
        let archive = build_test_archive("acme", "hello", "1.0.0");
        store.upload(&archive, false).unwrap();

        let err = store.upload(&archive, false).unwrap_err();
        assert!(matches!(err, CoreError::VersionExists { .. }));
    }

    #[test]
    fn lists_versions_in_numeric_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = KitStore::new(dir.path().to_path_buf());
        store.upload(&build_test_archive("acme", "hello", "2.0.0"), false).unwrap();
        store.upload(&build_test_archive("acme", "hello", "10.0.0"), false).unwrap();
        store.upload(&build_test_archive("acme", "hello", "1.0.0"), false).unwrap();

        let versions = store.list_versions("acme", "hello").unwrap();
        assert_eq!(versions, vec!["1.0.0", "2.0.0", "10.0.0"]);
    }

    #[test]
    fn delete_removes_empty_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = KitStore::new(dir.path().to_path_buf());
        store.upload(&build_test_archive("acme", "hello", "1.0.0"), false).unwrap();

        store.delete("acme", "hello", "1.0.0").unwrap();
        assert!(!dir.path().join("acme").exists());
    }
}
