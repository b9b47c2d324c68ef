use std::{collections::HashMap, path::Path, time::Instant};

use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};
use tch::{CModule, Device, IValue, Kind, Tensor, no_grad};
use tokenizers::{PaddingParams, Tokenizer};
use tracing::{info, warn};

use crate::{
    adapter::{self, AdapterConfig, AdapterError},
    config::AppConfig,
    error::EngineError,
    model::{
        AdapterMetadata, Completion, GenerationParams, GenerationStats, ModelMetadata,
        TextGenerator, decode_tokens,
    },
    quantization::{self, ComputeDtype, QuantizationConfig, QuantizationSummary},
};

/// TorchScript base model with NF4-quantized linear weights and a merged
/// LoRA adapter.
pub struct QuantizedLoraModel {
    tokenizer: Tokenizer,
    eos_id: u32,
    device: Device,
    module: Mutex<CModule>,
    metadata: ModelMetadata,
}

fn load_err(err: impl std::fmt::Display) -> EngineError {
    EngineError::Load(err.to_string())
}

fn gen_err(err: impl std::fmt::Display) -> EngineError {
    EngineError::Generation(err.to_string())
}

impl QuantizedLoraModel {
    pub fn load(config: &AppConfig) -> Result<Self, EngineError> {
        let (tokenizer, eos_id) = load_tokenizer(config)?;

        let adapter_config = AdapterConfig::load(&config.adapter_path)?;
        if let Some(trained_on) = adapter_config.base_model_name_or_path.as_deref() {
            if trained_on != config.base_model_id {
                warn!(
                    trained_on,
                    base_model = %config.base_model_id,
                    "adapter was trained on a different base model"
                );
            }
        }

        if !config.base_model_path.exists() {
            return Err(load_err(format!(
                "model artifact missing: {}",
                config.base_model_path.display()
            )));
        }

        info!(path = %config.base_model_path.display(), "loading base model");
        let configured = config.quantization.compute_dtype;
        let dtype = configured.effective(matches!(config.device, Device::Cpu));
        if dtype != configured {
            warn!(%configured, "half precision compute unsupported on cpu, using float32");
        }
        let kind = compute_kind(dtype);
        let mut module =
            CModule::load_on_device(&config.base_model_path, config.device).map_err(load_err)?;
        module.set_eval();
        module.to(config.device, kind, false);

        let mut params = module.named_parameters().map_err(load_err)?;

        let quantization = if config.quantization.load_in_4bit {
            let summary = quantize_linear_weights(&mut params, &config.quantization, dtype)?;
            info!(
                tensors = summary.quantized_tensors,
                reduction_percent = summary.size_reduction_percent,
                "quantized base model weights"
            );
            Some(summary)
        } else {
            None
        };

        info!(path = %config.adapter_path.display(), "loading LoRA adapters");
        let merged_tensors = merge_adapter(&mut params, &config.adapter_path, adapter_config.scale())?;
        info!(merged_tensors, scale = adapter_config.scale(), "adapter merged");

        let metadata = ModelMetadata {
            base_model: config.base_model_id.clone(),
            device: format!("{:?}", config.device),
            dtype: dtype.to_string(),
            adapter: AdapterMetadata {
                path: config.adapter_path.display().to_string(),
                rank: adapter_config.r,
                alpha: adapter_config.lora_alpha,
                merged_tensors,
            },
            quantization,
        };

        Ok(Self {
            tokenizer,
            eos_id,
            device: config.device,
            module: Mutex::new(module),
            metadata,
        })
    }

    fn next_logits(&self, module: &CModule, ids: &[u32]) -> Result<Vec<f32>, EngineError> {
        let input: Vec<i64> = ids.iter().map(|&id| id as i64).collect();
        let input_tensor = Tensor::from_slice(&input)
            .reshape([1, input.len() as i64])
            .to(self.device);

        // Traced causal LMs return either bare logits or a tuple led by them.
        let output = module
            .forward_is(&[IValue::Tensor(input_tensor)])
            .map_err(gen_err)?;
        let logits = match output {
            IValue::Tensor(t) => t,
            IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                IValue::Tensor(t) => t.shallow_clone(),
                _ => return Err(gen_err("expected tensor as first tuple element")),
            },
            _ => return Err(gen_err("unexpected model output format")),
        };

        // [1, seq_len, vocab] -> [vocab]
        let last = logits
            .select(1, -1)
            .squeeze()
            .to_kind(Kind::Float)
            .to_device(Device::Cpu);
        Vec::<f32>::try_from(&last).map_err(gen_err)
    }
}

impl TextGenerator for QuantizedLoraModel {
    fn complete(&self, prompt: &str, params: &GenerationParams) -> Result<Completion, EngineError> {
        let encoding = self.tokenizer.encode(prompt, true).map_err(gen_err)?;
        let prompt_ids = encoding.get_ids().to_vec();
        if prompt_ids.is_empty() {
            return Err(gen_err("prompt produced no tokens"));
        }

        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let start = Instant::now();
        let generated = no_grad(|| {
            let module = self.module.lock();
            decode_tokens(&prompt_ids, params, Some(self.eos_id), &mut rng, |ids| {
                self.next_logits(&module, ids)
            })
        })?;
        let elapsed = start.elapsed();

        let text = self.tokenizer.decode(&generated, true).map_err(gen_err)?;

        Ok(Completion {
            text,
            stats: GenerationStats {
                prompt_tokens: prompt_ids.len(),
                generated_tokens: generated.len(),
                total_time_ms: elapsed.as_millis(),
            },
        })
    }

    fn metadata(&self) -> ModelMetadata {
        self.metadata.clone()
    }
}

/// Returns the tokenizer with padding set up, plus the end-of-sequence id.
fn load_tokenizer(config: &AppConfig) -> Result<(Tokenizer, u32), EngineError> {
    let loaded = if config.tokenizer_path.exists() {
        Tokenizer::from_file(&config.tokenizer_path)
    } else {
        info!(
            model = %config.base_model_id,
            "tokenizer file not found, fetching from the hub"
        );
        Tokenizer::from_pretrained(&config.base_model_id, None)
    };
    let mut tokenizer = loaded.map_err(|e| load_err(format!("tokenizer: {e}")))?;

    // The base model defines no pad token.
    let eos_id = tokenizer
        .token_to_id(&config.eos_token)
        .ok_or_else(|| load_err(format!("tokenizer has no `{}` token", config.eos_token)))?;
    tokenizer.with_padding(Some(PaddingParams {
        pad_id: eos_id,
        pad_token: config.eos_token.clone(),
        ..Default::default()
    }));

    Ok((tokenizer, eos_id))
}

fn compute_kind(dtype: ComputeDtype) -> Kind {
    match dtype {
        ComputeDtype::F32 => Kind::Float,
        ComputeDtype::F16 => Kind::Half,
        ComputeDtype::Bf16 => Kind::BFloat16,
    }
}

fn is_quantizable(name: &str, param: &Tensor) -> bool {
    param.size().len() == 2
        && name.ends_with(".weight")
        && !name.contains("embed")
        && !name.contains("lm_head")
}

fn quantize_linear_weights(
    params: &mut [(String, Tensor)],
    config: &QuantizationConfig,
    dtype: ComputeDtype,
) -> Result<QuantizationSummary, EngineError> {
    no_grad(|| -> Result<QuantizationSummary, EngineError> {
        let mut summary = QuantizationSummary::new(config, dtype);
        for (name, param) in params.iter_mut() {
            if !is_quantizable(name, param) {
                continue;
            }
            let shape = param.size();
            let flat = param.to_kind(Kind::Float).to_device(Device::Cpu).flatten(0, -1);
            let values = Vec::<f32>::try_from(&flat).map_err(load_err)?;

            let quantized = quantization::quantize(&values, config.double_quant)?;
            let restored = Tensor::from_slice(&quantized.dequantize())
                .reshape(shape.as_slice())
                .to_kind(param.kind())
                .to_device(param.device());
            param.f_copy_(&restored).map_err(load_err)?;

            summary.record_weights(values.len(), quantized.storage_bytes());
        }
        Ok(summary)
    })
}

fn merge_adapter(
    params: &mut [(String, Tensor)],
    adapter_dir: &Path,
    scale: f64,
) -> Result<usize, EngineError> {
    let path = adapter::weights_path(adapter_dir);
    if !path.exists() {
        return Err(AdapterError::Missing(path).into());
    }
    let tensors = Tensor::read_safetensors(&path).map_err(load_err)?;
    let pairs = adapter::pair_weights(tensors)?;

    let index: HashMap<String, usize> = params
        .iter()
        .enumerate()
        .map(|(idx, (name, _))| (name.clone(), idx))
        .collect();

    no_grad(|| -> Result<usize, EngineError> {
        let mut merged = 0;
        for pair in pairs {
            let idx = *index
                .get(&pair.target)
                .ok_or_else(|| AdapterError::UnknownTarget(pair.target.clone()))?;
            let weight = &mut params[idx].1;

            // Checked up front: tch's infallible matmul panics on bad shapes.
            adapter::check_pair_shapes(
                &pair.target,
                &pair.a.size(),
                &pair.b.size(),
                &weight.size(),
            )?;

            let a = pair.a.to_device(weight.device()).to_kind(Kind::Float);
            let b = pair.b.to_device(weight.device()).to_kind(Kind::Float);
            let delta = b
                .f_matmul(&a)
                .and_then(|d| d.f_mul_scalar(scale))
                .map_err(load_err)?;

            let updated = weight
                .to_kind(Kind::Float)
                .f_add(&delta)
                .map_err(load_err)?
                .to_kind(weight.kind());
            weight.f_copy_(&updated).map_err(load_err)?;
            merged += 1;
        }
        Ok(merged)
    })
}
