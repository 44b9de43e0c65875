use serde::{Deserialize, Serialize};
use shelfkeep_store::{FieldMapping, ResolverConfig, StoreConfig};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub data_path: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub value_limit: Option<usize>,
    pub store: StoreConfig,
    pub dedupe: ResolverConfig,
    pub mapping: FieldMapping,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("shelfkeep-catalog.json"),
            backup_dir: None,
            value_limit: None,
            store: StoreConfig::default(),
            dedupe: ResolverConfig::default(),
            mapping: FieldMapping::default(),
        }
    }
}

fn parse_by_extension<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match ext.to_lowercase().as_str() {
        "toml" => Ok(toml::from_str(&contents)?),
        "json" => Ok(serde_json::from_str(&contents)?),
        _ => anyhow::bail!("Unsupported config file extension: {}", ext),
    }
}

impl CatalogConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let config: CatalogConfig = parse_by_extension(path)?;
        config.store.validate()?;
        Ok(config)
    }
}

/// Load a column mapping table (external label → field name) from TOML or JSON.
pub fn load_mapping(path: &Path) -> anyhow::Result<FieldMapping> {
    parse_by_extension(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = CatalogConfig::default();
        assert_eq!(config.data_path, PathBuf::from("shelfkeep-catalog.json"));
        assert!(config.backup_dir.is_none());
        assert!(config.value_limit.is_none());
        assert_eq!(config.store.chunk_size, shelfkeep_store::DEFAULT_CHUNK_SIZE);
        assert_eq!(config.dedupe.default_fields, vec!["title", "author", "series"]);
        assert!(config.mapping.is_empty());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
data_path = "/var/lib/shelfkeep/catalog.json"
backup_dir = "/mnt/backup"
value_limit = 5000000

[store]
chunk_size = 1024
obfuscation_key = "library-key"

[dedupe]
default_fields = ["title", "author"]
sequence_fields = ["volume"]

[dedupe.numerals]
uno = "1"

[mapping]
"Book Title" = "title"
"Writer" = "author"
"#
        )
        .unwrap();

        let config = CatalogConfig::from_file(file.path()).unwrap();
        assert_eq!(config.data_path, PathBuf::from("/var/lib/shelfkeep/catalog.json"));
        assert_eq!(config.backup_dir, Some(PathBuf::from("/mnt/backup")));
        assert_eq!(config.value_limit, Some(5_000_000));
        assert_eq!(config.store.chunk_size, 1024);
        assert_eq!(config.store.chunk_prefix, "shelfkeep_chunk_");
        assert_eq!(config.store.obfuscation_key.as_deref(), Some("library-key"));
        assert_eq!(config.dedupe.default_fields, vec!["title", "author"]);
        assert_eq!(config.dedupe.numerals["uno"], "1");
        assert_eq!(config.mapping.to_internal("Book Title"), "title");
        assert_eq!(config.mapping.to_internal("Writer"), "author");
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "data_path": "/tmp/cat.json",
                "store": {{ "chunk_size": 2048, "index_key": "idx", "chunk_prefix": "c_" }}
            }}"#
        )
        .unwrap();

        let config = CatalogConfig::from_file(file.path()).unwrap();
        assert_eq!(config.data_path, PathBuf::from("/tmp/cat.json"));
        assert_eq!(config.store.chunk_size, 2048);
        assert_eq!(config.store.index_key, "idx");
        assert_eq!(config.dedupe.sequence_fields, vec!["series", "volume"]);
    }

    #[test]
    fn test_invalid_store_config_rejected() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[store]\nchunk_size = 0").unwrap();
        assert!(CatalogConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(CatalogConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_load_mapping() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "\"Shelf\" = \"location\"").unwrap();
        let mapping = load_mapping(file.path()).unwrap();
        assert_eq!(mapping.to_internal("Shelf"), "location");
        assert_eq!(mapping.to_internal("Other"), "other");
    }
}
