//! SeedBundle: bootstrap payload for a fresh catalog.
//! Authored as YAML; the content hash identifies a bundle in logs.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::types::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedBundle {
    #[serde(default)]
    pub procedures: Vec<Procedure>,
    #[serde(default)]
    pub observable_properties: Vec<ObservableProperty>,
    #[serde(default)]
    pub offerings: Vec<Offering>,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub constellations: Vec<ConstellationSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstellationSeed {
    pub procedure: String,
    pub observable_property: String,
    pub offering: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_type: Option<ObservationType>,
    #[serde(default)]
    pub hidden_child: bool,
}

impl SeedBundle {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml).context("invalid seed bundle YAML")?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed bundle {}", path.display()))?;
        Self::from_yaml(&yaml)
    }

    /// Version-prefixed SHA-256 of the bundle's canonical JSON. Entries are
    /// sorted by identifier first so source ordering does not matter.
    pub fn compute_hash(&self) -> std::result::Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct Canonical<'a> {
            procedures: Vec<&'a Procedure>,
            observable_properties: Vec<&'a ObservableProperty>,
            offerings: Vec<&'a Offering>,
            features: Vec<&'a Feature>,
            constellations: Vec<&'a ConstellationSeed>,
        }

        let mut procedures: Vec<&Procedure> = self.procedures.iter().collect();
        procedures.sort_by_key(|p| p.id());

        let mut observable_properties: Vec<&ObservableProperty> =
            self.observable_properties.iter().collect();
        observable_properties.sort_by_key(|p| p.id());

        let mut offerings: Vec<&Offering> = self.offerings.iter().collect();
        offerings.sort_by_key(|o| o.id());

        let mut features: Vec<&Feature> = self.features.iter().collect();
        features.sort_by_key(|f| f.id());

        let mut constellations: Vec<&ConstellationSeed> = self.constellations.iter().collect();
        constellations.sort_by(|a, b| {
            (&a.procedure, &a.observable_property, &a.offering).cmp(&(
                &b.procedure,
                &b.observable_property,
                &b.offering,
            ))
        });

        let canonical = Canonical {
            procedures,
            observable_properties,
            offerings,
            features,
            constellations,
        };
        let json = serde_json::to_string(&canonical)?;
        let hash = Sha256::digest(json.as_bytes());
        Ok(format!("v1:{}", hex::encode(hash)))
    }
}
