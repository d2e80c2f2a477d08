//! The `capabilities.json` metadata served to discovery clients.

use serde::{Deserialize, Serialize};

use crate::{MapDirs, MapName, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesResponse {
    pub common_name: String,
    #[serde(rename = "iconURL")]
    pub icon_url: String,
    pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
}

impl CapabilitiesResponse {
    /// Serve `capabilities.json` verbatim when the map carries one,
    /// otherwise synthesize a default from the map name and the stored
    /// localization URL.
    pub fn for_map(dirs: &MapDirs, name: &MapName) -> Result<CapabilitiesResponse> {
        let path = dirs.capabilities_path();
        if path.is_file() {
            let text = std::fs::read_to_string(&path)?;
            return Ok(serde_json::from_str(&text)?);
        }
        let localization_url = match std::fs::read_to_string(dirs.localization_url_path()) {
            Ok(text) => text.trim().to_string(),
            Err(_) => format!("/localize/image/{name}"),
        };
        Ok(CapabilitiesResponse {
            common_name: name.to_string(),
            icon_url: format!("/static/icons/{name}.png"),
            services: vec![ServiceEntry {
                name: "localization".to_string(),
                url: localization_url,
                types: None,
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_default_uses_localization_url_file() {
        let tmp = tempfile::tempdir().unwrap();
        let name = MapName::new("atrium").unwrap();
        let dirs = MapDirs::new(tmp.path(), &name);
        std::fs::create_dir_all(dirs.root()).unwrap();
        std::fs::write(dirs.localization_url_path(), "https://example.net/loc\n").unwrap();

        let caps = CapabilitiesResponse::for_map(&dirs, &name).unwrap();
        assert_eq!(caps.common_name, "atrium");
        assert_eq!(caps.services[0].url, "https://example.net/loc");
    }

    #[test]
    fn existing_file_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let name = MapName::new("atrium").unwrap();
        let dirs = MapDirs::new(tmp.path(), &name);
        std::fs::create_dir_all(dirs.root()).unwrap();
        std::fs::write(
            dirs.capabilities_path(),
            r#"{"commonName":"Atrium East","iconURL":"/i.png","services":[]}"#,
        )
        .unwrap();
        let caps = CapabilitiesResponse::for_map(&dirs, &name).unwrap();
        assert_eq!(caps.common_name, "Atrium East");
        assert!(caps.services.is_empty());
    }
}
