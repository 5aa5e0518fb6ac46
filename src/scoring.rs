use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::error::{ArtifactError, DataError, SchemaError};
use crate::models::{FeatureVector, ScoredRecord, TrendLabel, FEATURE_NAMES};

/// Inference capability of a trained classifier: feature values in, trend probability out.
pub trait Scorer: Send + Sync {
    fn version(&self) -> &str;

    /// Ordered feature names the scorer was trained on.
    fn feature_names(&self) -> &[String];

    fn predict(&self, values: &[f64]) -> Result<f64, SchemaError>;
}

/// A versioned classifier exported by the offline training job.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    pub version: String,
    pub features: Vec<String>,
    pub model: ModelKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelKind {
    Logistic(LogisticModel),
    TreeEnsemble(TreeEnsemble),
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogisticModel {
    pub weights: Vec<f64>,
    #[serde(default)]
    pub intercept: f64,
}

/// Gradient boosted trees in the shape of an XGBoost JSON dump, margins summed then squashed.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeEnsemble {
    #[serde(default)]
    pub base_score: f64,
    pub trees: Vec<Tree>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        leaf: f64,
    },
}

impl ModelArtifact {
    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let raw = std::fs::read_to_string(path)?;
        let artifact: ModelArtifact = serde_json::from_str(&raw)?;
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.version.trim().is_empty() {
            return Err(SchemaError::InvalidArtifact("empty version".to_string()));
        }
        ensure_feature_schema(&self.features)?;

        let width = self.features.len();
        match &self.model {
            ModelKind::Logistic(model) => {
                if model.weights.len() != width {
                    return Err(SchemaError::ShapeMismatch {
                        expected: width,
                        actual: model.weights.len(),
                    });
                }
            }
            ModelKind::TreeEnsemble(ensemble) => {
                for (index, tree) in ensemble.trees.iter().enumerate() {
                    tree.validate(width).map_err(|reason| {
                        SchemaError::InvalidArtifact(format!("tree {index}: {reason}"))
                    })?;
                }
            }
        }
        Ok(())
    }
}

impl Tree {
    // Children must point forward, which also rules out cycles.
    fn validate(&self, width: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("no nodes".to_string());
        }
        for (index, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Split {
                feature,
                left,
                right,
                ..
            } = node
            {
                if *feature >= width {
                    return Err(format!("node {index} splits on feature {feature}"));
                }
                for child in [*left, *right] {
                    if child <= index || child >= self.nodes.len() {
                        return Err(format!("node {index} has invalid child {child}"));
                    }
                }
            }
        }
        Ok(())
    }

    fn leaf_value(&self, values: &[f64]) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Leaf { leaf } => return *leaf,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if values[*feature] < *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

impl Scorer for ModelArtifact {
    fn version(&self) -> &str {
        &self.version
    }

    fn feature_names(&self) -> &[String] {
        &self.features
    }

    fn predict(&self, values: &[f64]) -> Result<f64, SchemaError> {
        if values.len() != self.features.len() {
            return Err(SchemaError::ShapeMismatch {
                expected: self.features.len(),
                actual: values.len(),
            });
        }

        let margin = match &self.model {
            ModelKind::Logistic(model) => {
                model.intercept
                    + model
                        .weights
                        .iter()
                        .zip(values)
                        .map(|(w, x)| w * x)
                        .sum::<f64>()
            }
            ModelKind::TreeEnsemble(ensemble) => {
                ensemble.base_score
                    + ensemble
                        .trees
                        .iter()
                        .map(|tree| tree.leaf_value(values))
                        .sum::<f64>()
            }
        };

        Ok(sigmoid(margin))
    }
}

fn sigmoid(margin: f64) -> f64 {
    1.0 / (1.0 + (-margin).exp())
}

pub fn ensure_feature_schema(names: &[String]) -> Result<(), SchemaError> {
    if names.iter().map(String::as_str).eq(FEATURE_NAMES.iter().copied()) {
        return Ok(());
    }
    Err(SchemaError::FeatureMismatch {
        expected: names.to_vec(),
        found: FEATURE_NAMES.iter().map(|name| name.to_string()).collect(),
    })
}

pub fn label_for(probability: f64, threshold: f64) -> TrendLabel {
    if probability >= threshold {
        TrendLabel::Trending
    } else {
        TrendLabel::NotTrending
    }
}

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Data(#[from] DataError),
}

/// Applies a loaded scorer to feature vectors with a fixed decision threshold.
#[derive(Clone)]
pub struct ScoringEngine {
    scorer: Arc<dyn Scorer>,
    threshold: f64,
}

impl ScoringEngine {
    pub fn new(scorer: Arc<dyn Scorer>, threshold: f64) -> Result<Self, SchemaError> {
        ensure_feature_schema(scorer.feature_names())?;
        Ok(Self { scorer, threshold })
    }

    pub fn ensure_compatible(&self) -> Result<(), SchemaError> {
        ensure_feature_schema(self.scorer.feature_names())
    }

    pub fn model_version(&self) -> &str {
        self.scorer.version()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn score(&self, features: FeatureVector) -> Result<ScoredRecord, ScoringError> {
        let probability = self.scorer.predict(&features.values())?;
        if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
            return Err(DataError::InvalidProbability(probability).into());
        }

        Ok(ScoredRecord {
            entity_id: features.entity_id.clone(),
            observation_date: features.observation_date,
            probability,
            label: label_for(probability, self.threshold),
            model_version: self.scorer.version().to_string(),
            features,
        })
    }
}
