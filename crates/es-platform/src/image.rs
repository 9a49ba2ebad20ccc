//! Declarative container image for sweep functions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of the image build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum BuildStep {
    PipInstall { packages: Vec<String> },
    /// Bake the base model weights into the image.
    DownloadModel { model_id: String },
    /// Bake a dataset split into the image.
    DownloadDataset { dataset_id: String, split: String },
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PipInstall { packages } => write!(f, "pip install {}", packages.join(" ")),
            Self::DownloadModel { model_id } => write!(f, "download model {model_id}"),
            Self::DownloadDataset { dataset_id, split } => {
                write!(f, "download dataset {dataset_id} [{split}]")
            }
        }
    }
}

/// Base image plus ordered build steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub base: String,
    pub steps: Vec<BuildStep>,
}

impl ImageSpec {
    pub fn debian_slim() -> Self {
        Self {
            base: "debian-slim".to_string(),
            steps: Vec::new(),
        }
    }

    pub fn pip_install<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps.push(BuildStep::PipInstall {
            packages: packages.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn download_model(mut self, model_id: impl Into<String>) -> Self {
        self.steps.push(BuildStep::DownloadModel {
            model_id: model_id.into(),
        });
        self
    }

    pub fn download_dataset(mut self, dataset_id: impl Into<String>, split: impl Into<String>) -> Self {
        self.steps.push(BuildStep::DownloadDataset {
            dataset_id: dataset_id.into(),
            split: split.into(),
        });
        self
    }

    pub fn packages(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                BuildStep::PipInstall { packages } => Some(packages),
                _ => None,
            })
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// True if model or dataset downloads are baked in.
    pub fn has_prefetch(&self) -> bool {
        self.steps
            .iter()
            .any(|step| !matches!(step, BuildStep::PipInstall { .. }))
    }
}
