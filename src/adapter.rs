//! LoRA adapters saved in the PEFT layout: an `adapter_config.json` next to
//! an `adapter_model.safetensors` holding `lora_A` / `lora_B` pairs.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EngineError;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

const PEFT_PREFIX: &str = "base_model.model.";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter file missing: {}", .0.display())]
    Missing(PathBuf),
    #[error("invalid adapter config: {0}")]
    Config(String),
    #[error("adapter weight has no matching {missing} half: {target}")]
    Unpaired { target: String, missing: &'static str },
    #[error("adapter targets unknown base weight: {0}")]
    UnknownTarget(String),
    #[error("adapter factors for {target} do not compose: lora_A {a:?}, lora_B {b:?}")]
    MalformedPair {
        target: String,
        a: Vec<i64>,
        b: Vec<i64>,
    },
    #[error("adapter delta for {target} has shape {actual:?}, base weight is {expected:?}")]
    ShapeMismatch {
        target: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },
}

impl From<AdapterError> for EngineError {
    fn from(err: AdapterError) -> Self {
        EngineError::Load(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub target_modules: TargetModules,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default)]
    pub use_rslora: bool,
}

/// PEFT writes either a list of module names or a single pattern string.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

impl Default for TargetModules {
    fn default() -> Self {
        TargetModules::List(Vec::new())
    }
}

impl AdapterConfig {
    pub fn load(dir: &Path) -> Result<Self, AdapterError> {
        let path = dir.join(ADAPTER_CONFIG_FILE);
        if !path.exists() {
            return Err(AdapterError::Missing(path));
        }
        let raw = fs::read_to_string(&path).map_err(|e| AdapterError::Config(e.to_string()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, AdapterError> {
        let config: AdapterConfig =
            serde_json::from_str(raw).map_err(|e| AdapterError::Config(e.to_string()))?;
        if config.r == 0 {
            return Err(AdapterError::Config("rank `r` must be positive".into()));
        }
        Ok(config)
    }

    /// Multiplier applied to `B @ A` before it is added to the base weight.
    pub fn scale(&self) -> f64 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f64).sqrt()
        } else {
            self.lora_alpha / self.r as f64
        }
    }
}

pub fn weights_path(dir: &Path) -> PathBuf {
    dir.join(ADAPTER_WEIGHTS_FILE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraPart {
    A,
    B,
}

/// Maps a PEFT tensor name onto the base weight it modifies.
///
/// `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight` becomes
/// `model.layers.0.self_attn.q_proj.weight`. Returns `None` for tensors that
/// are not LoRA factors.
pub fn parse_lora_key(key: &str) -> Option<(String, LoraPart)> {
    let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);
    let key = key.strip_suffix(".weight")?;
    let key = key.strip_suffix(".default").unwrap_or(key);

    let (module, part) = if let Some(module) = key.strip_suffix(".lora_A") {
        (module, LoraPart::A)
    } else if let Some(module) = key.strip_suffix(".lora_B") {
        (module, LoraPart::B)
    } else {
        return None;
    };
    Some((format!("{module}.weight"), part))
}

#[derive(Debug)]
pub struct LoraPair<T> {
    pub target: String,
    pub a: T,
    pub b: T,
}

/// Groups raw adapter tensors into `(A, B)` pairs keyed by base weight name.
pub fn pair_weights<T>(tensors: Vec<(String, T)>) -> Result<Vec<LoraPair<T>>, AdapterError> {
    let mut halves: BTreeMap<String, (Option<T>, Option<T>)> = BTreeMap::new();
    for (name, tensor) in tensors {
        match parse_lora_key(&name) {
            Some((target, LoraPart::A)) => halves.entry(target).or_default().0 = Some(tensor),
            Some((target, LoraPart::B)) => halves.entry(target).or_default().1 = Some(tensor),
            None => tracing::debug!(%name, "skipping non-LoRA adapter tensor"),
        }
    }

    halves
        .into_iter()
        .map(|(target, halves)| match halves {
            (Some(a), Some(b)) => Ok(LoraPair { target, a, b }),
            (None, _) => Err(AdapterError::Unpaired {
                target,
                missing: "lora_A",
            }),
            (_, None) => Err(AdapterError::Unpaired {
                target,
                missing: "lora_B",
            }),
        })
        .collect()
}

/// Validates factor shapes before `B @ A` is formed.
///
/// Both factors must be 2-D with `B` as `[out, r]` and `A` as `[r, in]`, and
/// `[out, in]` must equal the base weight's shape.
pub fn check_pair_shapes(
    target: &str,
    a: &[i64],
    b: &[i64],
    weight: &[i64],
) -> Result<(), AdapterError> {
    if a.len() != 2 || b.len() != 2 || b[1] != a[0] {
        return Err(AdapterError::MalformedPair {
            target: target.to_string(),
            a: a.to_vec(),
            b: b.to_vec(),
        });
    }
    let delta = [b[0], a[1]];
    if weight != delta.as_slice() {
        return Err(AdapterError::ShapeMismatch {
            target: target.to_string(),
            expected: weight.to_vec(),
            actual: delta.to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_peft_keys_to_base_weights() {
        assert_eq!(
            parse_lora_key("base_model.model.model.layers.3.self_attn.q_proj.lora_A.weight"),
            Some(("model.layers.3.self_attn.q_proj.weight".to_string(), LoraPart::A))
        );
        assert_eq!(
            parse_lora_key("base_model.model.model.layers.3.mlp.down_proj.lora_B.default.weight"),
            Some(("model.layers.3.mlp.down_proj.weight".to_string(), LoraPart::B))
        );
        assert_eq!(parse_lora_key("base_model.model.lm_head.weight"), None);
    }

    #[test]
    fn pairs_factors_by_target() {
        let tensors = vec![
            ("base_model.model.a.q_proj.lora_B.weight".to_string(), 2),
            ("base_model.model.a.q_proj.lora_A.weight".to_string(), 1),
            ("base_model.model.a.v_proj.lora_A.weight".to_string(), 3),
            ("base_model.model.a.v_proj.lora_B.weight".to_string(), 4),
        ];
        let pairs = pair_weights(tensors).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].target, "a.q_proj.weight");
        assert_eq!((pairs[0].a, pairs[0].b), (1, 2));
        assert_eq!(pairs[1].target, "a.v_proj.weight");
    }

    #[test]
    fn unpaired_factor_is_an_error() {
        let tensors = vec![("base_model.model.a.q_proj.lora_A.weight".to_string(), 1)];
        let err = pair_weights(tensors).unwrap_err();
        assert!(matches!(err, AdapterError::Unpaired { missing: "lora_B", .. }));
    }

    #[test]
    fn composable_factors_pass_shape_check() {
        assert!(check_pair_shapes("q.weight", &[8, 64], &[32, 8], &[32, 64]).is_ok());
    }

    #[test]
    fn mismatched_ranks_are_rejected_before_multiplying() {
        let err = check_pair_shapes("q.weight", &[8, 64], &[32, 16], &[32, 64]).unwrap_err();
        assert!(matches!(err, AdapterError::MalformedPair { ref a, ref b, .. }
            if *a == vec![8, 64] && *b == vec![32, 16]));
    }

    #[test]
    fn non_matrix_factors_are_rejected() {
        let err = check_pair_shapes("q.weight", &[8], &[32, 8], &[32, 64]).unwrap_err();
        assert!(matches!(err, AdapterError::MalformedPair { .. }));
        let err = check_pair_shapes("q.weight", &[8, 64], &[2, 32, 8], &[32, 64]).unwrap_err();
        assert!(matches!(err, AdapterError::MalformedPair { .. }));
    }

    #[test]
    fn delta_must_match_base_weight() {
        let err = check_pair_shapes("q.weight", &[8, 64], &[32, 8], &[64, 64]).unwrap_err();
        assert!(matches!(err, AdapterError::ShapeMismatch { ref actual, .. } if *actual == vec![32, 64]));
    }

    #[test]
    fn parses_peft_config() {
        let config = AdapterConfig::parse(
            r#"{
                "r": 16,
                "lora_alpha": 32,
                "target_modules": ["q_proj", "v_proj"],
                "base_model_name_or_path": "TinyLlama/TinyLlama-1.1B-Chat-v1.0",
                "task_type": "CAUSAL_LM"
            }"#,
        )
        .unwrap();
        assert_eq!(config.r, 16);
        assert!((config.scale() - 2.0).abs() < 1e-12);
        assert!(matches!(config.target_modules, TargetModules::List(ref m) if m.len() == 2));
    }

    #[test]
    fn rslora_scales_by_square_root_of_rank() {
        let config =
            AdapterConfig::parse(r#"{"r": 16, "lora_alpha": 8, "use_rslora": true, "target_modules": "all-linear"}"#)
                .unwrap();
        assert!((config.scale() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn zero_rank_is_rejected() {
        assert!(AdapterConfig::parse(r#"{"r": 0, "lora_alpha": 8}"#).is_err());
    }

    #[test]
    fn missing_config_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = AdapterConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, AdapterError::Missing(_)));
    }
}
