//! Per-server overrides read from a test's configuration document.
//!
//! ```toml
//! [servers.0]
//! restart = true
//! load_dataset = "innodb_upgrade"
//! options = ["--innodb-file-per-table"]
//! ```

use std::{collections::BTreeMap, path::Path};

use fleet_utils::{error::ResultLocation, here};
use serde_derive::Deserialize;

use crate::error::FleetError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerOverride {
    /// Always reset the server before the test, whatever its options.
    #[serde(default)]
    pub restart: bool,
    /// Load this dataset into the server before it starts.
    pub load_dataset: Option<String>,
    /// Replace the options the test declares for this server.
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideDocument {
    servers: BTreeMap<usize, ServerOverride>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    #[serde(default)]
    servers: BTreeMap<String, ServerOverride>,
}

impl OverrideDocument {
    pub async fn load(path: &Path) -> Result<Self, FleetError> {
        let text = tokio::fs::read_to_string(path).await.located(here!())?;
        Self::parse(&text).map_err(|reason| FleetError::InvalidOverrides {
            path: path.to_owned(),
            reason,
        })
    }

    fn parse(text: &str) -> Result<Self, String> {
        let raw: RawDocument = toml::from_str(text).map_err(|e| e.to_string())?;
        let servers = raw
            .servers
            .into_iter()
            .map(|(key, value)| match key.parse::<usize>() {
                Ok(index) => Ok((index, value)),
                Err(_) => Err(format!("server key {key:?} is not a server index")),
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { servers })
    }

    pub fn get(&self, index: usize) -> Option<&ServerOverride> {
        self.servers.get(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod test {
    use indoc::indoc;

    use super::{OverrideDocument, ServerOverride};

    #[test]
    fn parse_per_server_tables() {
        let doc = OverrideDocument::parse(indoc! {r#"
            [servers.0]
            restart = true

            [servers.2]
            load_dataset = "innodb_upgrade"
            options = ["--innodb-file-per-table"]
        "#})
        .unwrap();

        assert_eq!(
            doc.get(0),
            Some(&ServerOverride {
                restart: true,
                ..Default::default()
            })
        );
        assert!(doc.get(1).is_none());
        let s2 = doc.get(2).unwrap();
        assert!(!s2.restart);
        assert_eq!(s2.load_dataset.as_deref(), Some("innodb_upgrade"));
        assert_eq!(
            s2.options.as_deref(),
            Some(&["--innodb-file-per-table".to_owned()][..])
        );
    }

    #[test]
    fn empty_document() {
        assert!(OverrideDocument::parse("").unwrap().is_empty());
    }

    #[test]
    fn rejects_non_index_keys() {
        let err = OverrideDocument::parse("[servers.master]\nrestart = true\n").unwrap_err();
        assert!(err.contains("\"master\""), "{err}");
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(OverrideDocument::parse("[servers.0]\nrestrat = true\n").is_err());
    }

    #[tokio::test]
    async fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("test.toml");
        std::fs::write(&path, "[servers.1]\nrestart = true\n").unwrap();

        let doc = OverrideDocument::load(&path).await.unwrap();
        assert!(doc.get(1).unwrap().restart);

        let missing = OverrideDocument::load(&tmp.path().join("nope.toml")).await;
        assert!(missing.is_err());
    }
}
