use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use url::Url;

use crate::{
    error::{DecisionServiceError, Result},
    metadata::LATEST_CLIENT_SETTINGS_KEY,
    store::{HttpMetadataStore, MetadataStore, SqliteMetadataStore},
};

fn default_settings_uri() -> String {
    LATEST_CLIENT_SETTINGS_KEY.to_string()
}

/// Client-side configuration of one decision service application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionServiceConfiguration {
    /// Location of the metadata record, resolved by the configured store.
    #[serde(default = "default_settings_uri")]
    pub settings_uri: String,
    /// Reuse supplied metadata instead of fetching it.
    #[serde(default)]
    pub offline_mode: bool,
    /// Attach diagnostics under the metadata's diagnostics key after a fetch.
    #[serde(default)]
    pub log_diagnostics: bool,
    /// Passed through to the policy mapper.
    #[serde(default)]
    pub development_mode: bool,
    /// Directory for the JSONL event sink. Defaults to `$MWT_DATA/events`.
    #[serde(default)]
    pub events_dir: Option<PathBuf>,
    #[serde(default)]
    pub store: StoreSettings,
}

impl Default for DecisionServiceConfiguration {
    fn default() -> Self {
        Self {
            settings_uri: default_settings_uri(),
            offline_mode: false,
            log_diagnostics: false,
            development_mode: false,
            events_dir: None,
            store: StoreSettings::default(),
        }
    }
}

/// Metadata store backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum StoreSettings {
    Sqlite {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Http {
        base_url: String,
    },
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings::Sqlite { path: None }
    }
}

impl StoreSettings {
    pub fn build(&self) -> Result<Arc<dyn MetadataStore>> {
        match self {
            StoreSettings::Sqlite { path: Some(path) } => {
                Ok(Arc::new(SqliteMetadataStore::open(path.clone())))
            }
            StoreSettings::Sqlite { path: None } => Ok(Arc::new(SqliteMetadataStore::default())),
            StoreSettings::Http { base_url } => {
                let base = Url::parse(base_url).map_err(|err| {
                    DecisionServiceError::Config(format!("invalid store base_url '{base_url}': {err}"))
                })?;
                Ok(Arc::new(HttpMetadataStore::new(base)))
            }
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<DecisionServiceConfiguration> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|err| {
        DecisionServiceError::Config(format!("failed to read {}: {err}", path.display()))
    })?;
    serde_yaml_ng::from_str(&content).map_err(|err| {
        DecisionServiceError::Config(format!("failed to parse {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_yaml_merges_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "offline_mode: true\nstore:\n  kind: http\n  base_url: https://blobs.example/").unwrap();

        let cfg = load_config(file.path()).unwrap();
        assert!(cfg.offline_mode);
        assert!(!cfg.log_diagnostics);
        assert_eq!(cfg.settings_uri, LATEST_CLIENT_SETTINGS_KEY);
        assert_eq!(
            cfg.store,
            StoreSettings::Http {
                base_url: "https://blobs.example/".into()
            }
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "offline: true").unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(DecisionServiceError::Config(_))
        ));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(matches!(
            load_config("/does/not/exist.yaml"),
            Err(DecisionServiceError::Config(_))
        ));
    }

    #[test]
    fn invalid_http_base_url_fails_to_build() {
        let settings = StoreSettings::Http {
            base_url: "not a url".into(),
        };
        assert!(settings.build().is_err());
    }
}
