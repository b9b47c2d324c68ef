//! 4-bit NormalFloat (NF4) weight quantization with optional double
//! quantization of the per-block scales.
//!
//! Weights are split into blocks of [`NF4_BLOCK_SIZE`] values. Each block is
//! normalised by its absolute maximum and every value is replaced by the index
//! of the closest entry in [`NF4_CODE`], two indices packed per byte. With
//! double quantization the block maxima are centred on their mean and stored
//! as signed 8-bit codes, one `f32` scale per [`SCALE_GROUP_SIZE`] blocks.

use std::{fmt, str::FromStr};

use serde::Serialize;
use thiserror::Error;

use crate::error::EngineError;

/// NF4 code book: quantiles of a standard normal rescaled to `[-1, 1]`.
pub const NF4_CODE: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

pub const NF4_BLOCK_SIZE: usize = 64;
pub const SCALE_GROUP_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum QuantizationError {
    #[error("unsupported quantization type: {0}")]
    UnsupportedType(String),
    #[error("unsupported compute dtype: {0}")]
    UnsupportedDtype(String),
    #[error("non-finite weight in block {0}")]
    NonFinite(usize),
}

impl From<QuantizationError> for EngineError {
    fn from(err: QuantizationError) -> Self {
        EngineError::Load(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    Nf4,
}

impl FromStr for QuantType {
    type Err = QuantizationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "nf4" => Ok(QuantType::Nf4),
            other => Err(QuantizationError::UnsupportedType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDtype {
    F16,
    Bf16,
    F32,
}

impl ComputeDtype {
    /// The dtype weights are actually held in. Half precision is not
    /// supported on cpu, which runs in float32 instead.
    pub fn effective(self, on_cpu: bool) -> ComputeDtype {
        if on_cpu { ComputeDtype::F32 } else { self }
    }

    pub fn size_bytes(self) -> u64 {
        match self {
            ComputeDtype::F16 | ComputeDtype::Bf16 => 2,
            ComputeDtype::F32 => 4,
        }
    }
}

impl fmt::Display for ComputeDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComputeDtype::F16 => "float16",
            ComputeDtype::Bf16 => "bfloat16",
            ComputeDtype::F32 => "float32",
        };
        f.write_str(name)
    }
}

impl FromStr for ComputeDtype {
    type Err = QuantizationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "f16" | "fp16" | "float16" | "half" => Ok(ComputeDtype::F16),
            "bf16" | "bfloat16" => Ok(ComputeDtype::Bf16),
            "f32" | "fp32" | "float32" | "float" => Ok(ComputeDtype::F32),
            other => Err(QuantizationError::UnsupportedDtype(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuantizationConfig {
    pub load_in_4bit: bool,
    pub double_quant: bool,
    pub quant_type: QuantType,
    pub compute_dtype: ComputeDtype,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            load_in_4bit: true,
            double_quant: true,
            quant_type: QuantType::Nf4,
            compute_dtype: ComputeDtype::F16,
        }
    }
}

#[derive(Debug, Clone)]
enum BlockScales {
    Plain(Vec<f32>),
    Double {
        codes: Vec<i8>,
        group_scales: Vec<f32>,
        offset: f32,
    },
}

#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    len: usize,
    codes: Vec<u8>,
    scales: BlockScales,
}

pub fn quantize(values: &[f32], double_quant: bool) -> Result<QuantizedTensor, QuantizationError> {
    let mut codes = vec![0u8; values.len().div_ceil(2)];
    let mut absmax = Vec::with_capacity(values.len().div_ceil(NF4_BLOCK_SIZE));

    for (block_idx, block) in values.chunks(NF4_BLOCK_SIZE).enumerate() {
        let mut max = 0.0f32;
        for &v in block {
            if !v.is_finite() {
                return Err(QuantizationError::NonFinite(block_idx));
            }
            max = max.max(v.abs());
        }
        absmax.push(max);

        let base = block_idx * NF4_BLOCK_SIZE;
        for (i, &v) in block.iter().enumerate() {
            let normalised = if max > 0.0 { v / max } else { 0.0 };
            let code = nearest_code(normalised);
            let pos = base + i;
            if pos % 2 == 0 {
                codes[pos / 2] |= code << 4;
            } else {
                codes[pos / 2] |= code;
            }
        }
    }

    let scales = if double_quant {
        quantize_scales(&absmax)
    } else {
        BlockScales::Plain(absmax)
    };

    Ok(QuantizedTensor {
        len: values.len(),
        codes,
        scales,
    })
}

impl QuantizedTensor {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes held by the packed codes and the block scales.
    pub fn storage_bytes(&self) -> u64 {
        let scale_bytes = match &self.scales {
            BlockScales::Plain(absmax) => absmax.len() * 4,
            BlockScales::Double {
                codes,
                group_scales,
                ..
            } => codes.len() + group_scales.len() * 4 + 4,
        };
        (self.codes.len() + scale_bytes) as u64
    }

    pub fn dequantize(&self) -> Vec<f32> {
        let absmax = self.block_absmax();
        let mut out = Vec::with_capacity(self.len);
        for pos in 0..self.len {
            let byte = self.codes[pos / 2];
            let code = if pos % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            out.push(NF4_CODE[code as usize] * absmax[pos / NF4_BLOCK_SIZE]);
        }
        out
    }

    fn block_absmax(&self) -> Vec<f32> {
        match &self.scales {
            BlockScales::Plain(absmax) => absmax.clone(),
            BlockScales::Double {
                codes,
                group_scales,
                offset,
            } => codes
                .iter()
                .enumerate()
                .map(|(i, &c)| {
                    let scale = group_scales[i / SCALE_GROUP_SIZE];
                    (c as f32 / 127.0 * scale + offset).max(0.0)
                })
                .collect(),
        }
    }
}

fn quantize_scales(absmax: &[f32]) -> BlockScales {
    let offset = if absmax.is_empty() {
        0.0
    } else {
        absmax.iter().sum::<f32>() / absmax.len() as f32
    };

    let mut codes = Vec::with_capacity(absmax.len());
    let mut group_scales = Vec::with_capacity(absmax.len().div_ceil(SCALE_GROUP_SIZE));
    for group in absmax.chunks(SCALE_GROUP_SIZE) {
        let scale = group
            .iter()
            .map(|a| (a - offset).abs())
            .fold(0.0f32, f32::max);
        group_scales.push(scale);
        for &a in group {
            let code = if scale > 0.0 {
                ((a - offset) / scale * 127.0).round().clamp(-127.0, 127.0) as i8
            } else {
                0
            };
            codes.push(code);
        }
    }

    BlockScales::Double {
        codes,
        group_scales,
        offset,
    }
}

fn nearest_code(x: f32) -> u8 {
    // NF4_CODE is sorted, so the nearest entry is on either side of the
    // partition point.
    let idx = NF4_CODE.partition_point(|&c| c < x);
    if idx == 0 {
        return 0;
    }
    if idx == NF4_CODE.len() {
        return (NF4_CODE.len() - 1) as u8;
    }
    let below = NF4_CODE[idx - 1];
    let above = NF4_CODE[idx];
    if (x - below) <= (above - x) {
        (idx - 1) as u8
    } else {
        idx as u8
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuantizationSummary {
    pub quant_type: QuantType,
    pub double_quant: bool,
    pub compute_dtype: ComputeDtype,
    pub quantized_tensors: usize,
    pub baseline_size_bytes: u64,
    pub quantized_size_bytes: u64,
    pub size_reduction_percent: f64,
}

impl QuantizationSummary {
    /// `compute_dtype` is the dtype the unquantized weights are held in,
    /// which sets the baseline each tensor is measured against.
    pub fn new(config: &QuantizationConfig, compute_dtype: ComputeDtype) -> Self {
        Self {
            quant_type: config.quant_type,
            double_quant: config.double_quant,
            compute_dtype,
            quantized_tensors: 0,
            baseline_size_bytes: 0,
            quantized_size_bytes: 0,
            size_reduction_percent: 0.0,
        }
    }

    /// Records one tensor of `elements` weights held in `compute_dtype`.
    pub fn record_weights(&mut self, elements: usize, quantized_bytes: u64) {
        self.record(elements as u64 * self.compute_dtype.size_bytes(), quantized_bytes);
    }

    pub fn record(&mut self, baseline_bytes: u64, quantized_bytes: u64) {
        self.quantized_tensors += 1;
        self.baseline_size_bytes += baseline_bytes;
        self.quantized_size_bytes += quantized_bytes;
        self.size_reduction_percent =
            reduction_percent(self.baseline_size_bytes, self.quantized_size_bytes);
    }
}

fn reduction_percent(baseline: u64, quantized: u64) -> f64 {
    if baseline == 0 {
        0.0
    } else {
        let diff = baseline.saturating_sub(quantized) as f64;
        (diff / baseline as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| ((i as f32 * 0.37).sin() * 2.5) - 0.1)
            .collect()
    }

    fn max_gap() -> f32 {
        NF4_CODE
            .windows(2)
            .map(|w| w[1] - w[0])
            .fold(0.0, f32::max)
    }

    #[test]
    fn code_book_values_survive_round_trip() {
        let values: Vec<f32> = NF4_CODE.iter().map(|c| c * 3.0).collect();
        let restored = quantize(&values, false).unwrap().dequantize();
        for (a, b) in values.iter().zip(&restored) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn error_is_bounded_by_block_absmax() {
        let values = ramp(1000);
        let restored = quantize(&values, false).unwrap().dequantize();
        assert_eq!(restored.len(), values.len());

        let half_gap = max_gap() / 2.0;
        for (block, restored_block) in values.chunks(NF4_BLOCK_SIZE).zip(restored.chunks(NF4_BLOCK_SIZE)) {
            let absmax = block.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            for (a, b) in block.iter().zip(restored_block) {
                assert!((a - b).abs() <= absmax * half_gap + 1e-5);
            }
        }
    }

    #[test]
    fn double_quant_stays_close_to_plain() {
        let values = ramp(64 * 300);
        let plain = quantize(&values, false).unwrap().dequantize();
        let double = quantize(&values, true).unwrap().dequantize();
        for (a, b) in plain.iter().zip(&double) {
            assert!((a - b).abs() < 0.05, "{a} vs {b}");
        }
    }

    #[test]
    fn zero_block_restores_zeros() {
        let restored = quantize(&[0.0; 100], true).unwrap().dequantize();
        assert!(restored.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn odd_length_is_packed_correctly() {
        let values = vec![1.0, -1.0, 0.0];
        let q = quantize(&values, false).unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q.dequantize(), vec![1.0, -1.0, 0.0]);
    }

    #[test]
    fn storage_is_roughly_four_bits_per_weight() {
        let values = ramp(64 * 256);
        let plain = quantize(&values, false).unwrap();
        let double = quantize(&values, true).unwrap();

        // 8192 code bytes, 256 blocks
        assert_eq!(plain.storage_bytes(), 8192 + 256 * 4);
        assert_eq!(double.storage_bytes(), 8192 + 256 + 4 + 4);
        assert!(double.storage_bytes() < plain.storage_bytes());
    }

    #[test]
    fn non_finite_weights_are_rejected() {
        let mut values = vec![0.5; 130];
        values[129] = f32::NAN;
        assert!(matches!(
            quantize(&values, true),
            Err(QuantizationError::NonFinite(2))
        ));
    }

    #[test]
    fn parses_config_names() {
        assert_eq!("NF4".parse::<QuantType>().unwrap(), QuantType::Nf4);
        assert!("fp4".parse::<QuantType>().is_err());
        assert_eq!("float16".parse::<ComputeDtype>().unwrap(), ComputeDtype::F16);
        assert_eq!("bf16".parse::<ComputeDtype>().unwrap(), ComputeDtype::Bf16);
        assert!("int8".parse::<ComputeDtype>().is_err());
    }

    #[test]
    fn summary_tracks_size_reduction() {
        let mut summary =
            QuantizationSummary::new(&QuantizationConfig::default(), ComputeDtype::F16);
        summary.record(1000, 250);
        summary.record(1000, 250);
        assert_eq!(summary.quantized_tensors, 2);
        assert_eq!(summary.baseline_size_bytes, 2000);
        assert!((summary.size_reduction_percent - 75.0).abs() < 1e-9);
    }

    #[test]
    fn half_precision_falls_back_to_float32_on_cpu() {
        assert_eq!(ComputeDtype::F16.effective(true), ComputeDtype::F32);
        assert_eq!(ComputeDtype::Bf16.effective(true), ComputeDtype::F32);
        assert_eq!(ComputeDtype::F16.effective(false), ComputeDtype::F16);
        assert_eq!(ComputeDtype::F32.effective(false), ComputeDtype::F32);
    }

    #[test]
    fn cpu_baseline_is_measured_in_float32() {
        let config = QuantizationConfig::default();
        assert_eq!(config.compute_dtype, ComputeDtype::F16);

        let mut summary = QuantizationSummary::new(&config, config.compute_dtype.effective(true));
        summary.record_weights(1000, 500);
        assert_eq!(summary.compute_dtype, ComputeDtype::F32);
        assert_eq!(summary.baseline_size_bytes, 4000);
        assert!((summary.size_reduction_percent - 87.5).abs() < 1e-9);

        let mut gpu = QuantizationSummary::new(&config, config.compute_dtype.effective(false));
        gpu.record_weights(1000, 500);
        assert_eq!(gpu.baseline_size_bytes, 2000);
        assert!((gpu.size_reduction_percent - 75.0).abs() < 1e-9);
    }
}
