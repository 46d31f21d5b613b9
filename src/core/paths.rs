//! Path mapper (spec §4.B): the *only* code that manufactures driver paths,
//! translating the core's object model (blobs by digest, manifest
//! revisions, tag links, upload sessions) into the generic paths the
//! [`Driver`](crate::core::driver::Driver) understands.
//!
//! Generalized from the teacher's `storage/paths.rs`, which folded blob
//! data and repository links into one tree. Here the global
//! content-addressable stores (`blobs/`, `manifests/`) are kept separate
//! from per-repository link files, so two repositories referencing the
//! same layer or manifest never duplicate the payload — required by the
//! "stores the payload once globally... links the revision under the
//! repository" language for manifests, mirrored here for blobs:
//!
//! ```text
//! <root>
//! ├── blobs/<algo>/<first 2 hex>/<hex>/data
//! ├── manifests/<algo>/<first 2 hex>/<hex>/{data,signatures}
//! ├── uploads/<uuid>/{data,startedat}
//! └── repositories/<name>
//!     ├── _layers/<algo>/<hex>/link
//!     └── _manifests
//!         ├── revisions/<algo>/<hex>/link
//!         └── tags/<tag>
//!             ├── current/link
//!             └── index/<algo>/<hex>/link
//! ```

use crate::core::digest::Digest;

#[derive(Clone, Debug, Default)]
pub struct PathMapper;

impl PathMapper {
    pub fn new() -> Self {
        Self
    }

    fn digest_shard(digest: &Digest) -> (String, String) {
        (digest.algorithm().to_string(), digest.digest().to_string())
    }

    // --- global blob store -------------------------------------------------

    pub fn blobs_path(&self) -> String {
        "blobs".to_string()
    }

    pub fn blob_path(&self, digest: &Digest) -> String {
        let (algo, hex) = Self::digest_shard(digest);
        format!("blobs/{algo}/{}/{hex}", &hex[..2])
    }

    pub fn blob_data_path(&self, digest: &Digest) -> String {
        format!("{}/data", self.blob_path(digest))
    }

    // --- global manifest payload store --------------------------------------

    pub fn manifest_blob_path(&self, digest: &Digest) -> String {
        let (algo, hex) = Self::digest_shard(digest);
        format!("manifests/{algo}/{}/{hex}", &hex[..2])
    }

    pub fn manifest_blob_data_path(&self, digest: &Digest) -> String {
        format!("{}/data", self.manifest_blob_path(digest))
    }

    pub fn manifest_blob_signatures_path(&self, digest: &Digest) -> String {
        format!("{}/signatures", self.manifest_blob_path(digest))
    }

    // --- uploads -------------------------------------------------------------

    pub fn uploads_path(&self) -> String {
        "uploads".to_string()
    }

    pub fn upload_path(&self, id: &str) -> String {
        format!("uploads/{id}")
    }

    pub fn upload_data_path(&self, id: &str) -> String {
        format!("{}/data", self.upload_path(id))
    }

    pub fn upload_started_at_path(&self, id: &str) -> String {
        format!("{}/startedat", self.upload_path(id))
    }

    // --- per-repository links -------------------------------------------------

    pub fn repository_path(&self, name: &str) -> String {
        format!("repositories/{name}")
    }

    /// Link file recording that `digest` is reachable from repository
    /// `name`'s layer set; body is `algo:hex` per spec §4.B.
    pub fn layer_link_path(&self, name: &str, digest: &Digest) -> String {
        let (algo, hex) = Self::digest_shard(digest);
        format!("{}/_layers/{algo}/{hex}/link", self.repository_path(name))
    }

    pub fn manifests_path(&self, name: &str) -> String {
        format!("{}/_manifests", self.repository_path(name))
    }

    pub fn manifest_revisions_path(&self, name: &str) -> String {
        format!("{}/revisions", self.manifests_path(name))
    }

    pub fn manifest_revision_link_path(&self, name: &str, digest: &Digest) -> String {
        let (algo, hex) = Self::digest_shard(digest);
        format!("{}/{algo}/{hex}/link", self.manifest_revisions_path(name))
    }

    pub fn manifest_tags_path(&self, name: &str) -> String {
        format!("{}/tags", self.manifests_path(name))
    }

    pub fn manifest_tag_path(&self, name: &str, tag: &str) -> String {
        format!("{}/{}", self.manifest_tags_path(name), tag)
    }

    /// Link holding the digest a tag currently points at.
    pub fn manifest_tag_current_link_path(&self, name: &str, tag: &str) -> String {
        format!("{}/current/link", self.manifest_tag_path(name, tag))
    }

    /// Append-only index of every digest a tag has ever pointed at; written
    /// *after* `current` so a reader observing `current` can also find the
    /// matching history entry (spec §4.D ordering requirement).
    pub fn manifest_tag_index_link_path(&self, name: &str, tag: &str, digest: &Digest) -> String {
        let (algo, hex) = Self::digest_shard(digest);
        format!("{}/index/{algo}/{hex}/link", self.manifest_tag_path(name, tag))
    }

    // --- durable component state ---------------------------------------------

    pub fn state_path(&self) -> String {
        "_state".to_string()
    }

    pub fn scheduler_state_path(&self) -> String {
        format!("{}/scheduler.json", self.state_path())
    }

    pub fn migration_state_path(&self) -> String {
        format!("{}/migration.json", self.state_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn digest() -> Digest {
        Digest::from_str(&format!("sha256:{}", "a".repeat(64))).unwrap()
    }

    #[test]
    fn blob_path_shards_by_first_two_hex_chars() {
        let mapper = PathMapper::new();
        let d = digest();
        assert_eq!(mapper.blob_path(&d), format!("blobs/sha256/aa/{}", "a".repeat(64)));
    }

    #[test]
    fn tag_current_and_index_paths_differ() {
        let mapper = PathMapper::new();
        let d = digest();
        assert_ne!(
            mapper.manifest_tag_current_link_path("library/alpine", "latest"),
            mapper.manifest_tag_index_link_path("library/alpine", "latest", &d)
        );
    }

    #[test]
    fn blob_and_manifest_stores_are_disjoint_namespaces() {
        let mapper = PathMapper::new();
        let d = digest();
        assert_ne!(mapper.blob_data_path(&d), mapper.manifest_blob_data_path(&d));
    }
}
