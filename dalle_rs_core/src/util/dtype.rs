use std::fmt::Display;

use dalle_rs_common::DType;
use serde::Deserialize;
use tracing::info;

#[derive(Clone, Copy, Default, Debug, Deserialize, PartialEq, Eq, clap::ValueEnum)]
/// DType for the model.
///
/// Note: When using `Auto`, parameters keep the precision they were stored with.
pub enum ModelDType {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "bf16")]
    BF16,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "f32")]
    F32,
}

impl Display for ModelDType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::BF16 => write!(f, "bf16"),
            Self::F16 => write!(f, "f16"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

/// Type which can be converted to a target precision. `None` means "keep the stored precision".
pub trait TryIntoDType {
    fn try_into_dtype(&self, silent: bool) -> anyhow::Result<Option<DType>>;
}

impl TryIntoDType for DType {
    fn try_into_dtype(&self, silent: bool) -> anyhow::Result<Option<DType>> {
        if !silent {
            info!("dtype selected is {self}.");
        }
        Ok(Some(*self))
    }
}

impl TryIntoDType for ModelDType {
    fn try_into_dtype(&self, silent: bool) -> anyhow::Result<Option<DType>> {
        let dtype = match self {
            Self::Auto => None,
            Self::BF16 => Some(DType::BF16),
            Self::F16 => Some(DType::F16),
            Self::F32 => Some(DType::F32),
        };
        if !silent {
            match dtype {
                Some(dtype) => info!("dtype selected is {dtype}."),
                None => info!("dtype selected is auto, keeping stored precision."),
            }
        }
        Ok(dtype)
    }
}
