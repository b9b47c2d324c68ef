use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::{
    model::GenerationParams,
    quantization::{ComputeDtype, QuantType, QuantizationConfig},
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub base_model_id: String,
    pub base_model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub adapter_path: PathBuf,
    pub eos_token: String,
    pub generation: GenerationParams,
    pub quantization: QuantizationConfig,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source. Malformed numbers
    /// fall back to their defaults; unknown quantization settings are errors.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("SERVER_ADDR")
            .unwrap_or_else(|| "0.0.0.0:5000".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5000));

        let base_model_id = lookup("BASE_MODEL_ID")
            .unwrap_or_else(|| "TinyLlama/TinyLlama-1.1B-Chat-v1.0".to_string());
        let base_model_path = PathBuf::from(
            lookup("BASE_MODEL_PATH").unwrap_or_else(|| "models/tinyllama.ts".to_string()),
        );
        let tokenizer_path = PathBuf::from(
            lookup("TOKENIZER_PATH").unwrap_or_else(|| "models/tokenizer.json".to_string()),
        );
        let adapter_path = PathBuf::from(
            lookup("ADAPTER_PATH").unwrap_or_else(|| "./tinyllama-indian-legal-qlora".to_string()),
        );
        let eos_token = lookup("EOS_TOKEN").unwrap_or_else(|| "</s>".to_string());

        let defaults = GenerationParams::default();
        let generation = GenerationParams {
            max_length: parse_or(&lookup, "MAX_LENGTH", defaults.max_length),
            do_sample: lookup("DO_SAMPLE")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.do_sample),
            temperature: parse_or(&lookup, "TEMPERATURE", defaults.temperature),
            top_k: parse_or(&lookup, "TOP_K", defaults.top_k),
            top_p: parse_or(&lookup, "TOP_P", defaults.top_p),
            repetition_penalty: parse_or(&lookup, "REPETITION_PENALTY", defaults.repetition_penalty),
            seed: lookup("GENERATION_SEED").and_then(|v| v.parse().ok()),
        };

        let quantization = QuantizationConfig {
            load_in_4bit: lookup("LOAD_IN_4BIT")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
            double_quant: lookup("QUANT_DOUBLE")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
            quant_type: lookup("QUANT_TYPE")
                .as_deref()
                .map(QuantType::from_str)
                .transpose()?
                .unwrap_or(QuantType::Nf4),
            compute_dtype: lookup("COMPUTE_DTYPE")
                .as_deref()
                .map(ComputeDtype::from_str)
                .transpose()?
                .unwrap_or(ComputeDtype::F16),
        };

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = lookup("DEVICE").unwrap_or_else(|| "cpu".into());
            parse_device(&raw)
        };

        Ok(Self {
            listen_addr,
            base_model_id,
            base_model_path,
            tokenizer_path,
            adapter_path,
            eos_token,
            generation,
            quantization,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            tracing::warn!(requested = %raw, "CUDA unavailable, falling back to cpu");
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}
