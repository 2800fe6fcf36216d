use serde::Deserialize;
use thiserror::Error;

/// Conditioning scale used by the published generator checkpoints.
pub const DEFAULT_CONDITION_SCALE: f32 = 10.0;

pub const DEFAULT_N_PREDICTIONS: usize = 8;

#[derive(Error, Debug, PartialEq)]
pub enum ParamsError {
    #[error("`top_k` must be at least 1.")]
    ZeroTopK,
    #[error("`top_p` must be in (0, 1], got {0}.")]
    TopPOutOfRange(f32),
    #[error("`temperature` must be positive, got {0}.")]
    NonPositiveTemperature(f32),
    #[error("`condition_scale` must be finite, got {0}.")]
    NonFiniteConditionScale(f32),
}

/// Sampling parameters handed to the generator. `None` selects the model default.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Keep only the `top_k` most likely tokens at every step.
    pub top_k: Option<usize>,
    /// Keep the smallest set of tokens whose cumulative probability reaches `top_p`.
    pub top_p: Option<f32>,
    pub temperature: Option<f32>,
    /// Higher conditioning scale steers generation more strongly towards the prompt,
    /// usually at the expense of diversity.
    pub condition_scale: Option<f32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: None,
            top_p: None,
            temperature: None,
            condition_scale: Some(DEFAULT_CONDITION_SCALE),
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.top_k == Some(0) {
            return Err(ParamsError::ZeroTopK);
        }
        if let Some(top_p) = self.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return Err(ParamsError::TopPOutOfRange(top_p));
            }
        }
        if let Some(temperature) = self.temperature {
            if !(temperature > 0.0) {
                return Err(ParamsError::NonPositiveTemperature(temperature));
            }
        }
        if let Some(scale) = self.condition_scale {
            if !scale.is_finite() {
                return Err(ParamsError::NonFiniteConditionScale(scale));
            }
        }
        Ok(())
    }
}

/// Generation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GenerationParams {
    /// Number of images wanted per prompt. The pipeline rounds this up to a multiple of the device
    /// count.
    #[serde(default = "default_n_predictions")]
    pub n_predictions: usize,
    /// Initial random seed. The same seed and device count reproduce the same images.
    pub seed: u64,
    #[serde(default)]
    pub sampling: SamplingParams,
}

fn default_n_predictions() -> usize {
    DEFAULT_N_PREDICTIONS
}

impl GenerationParams {
    pub fn new(seed: u64) -> Self {
        Self {
            n_predictions: DEFAULT_N_PREDICTIONS,
            seed,
            sampling: SamplingParams::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        self.sampling.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::{GenerationParams, ParamsError, SamplingParams};

    #[test]
    fn defaults() {
        let params = GenerationParams::new(3);
        assert_eq!(params.n_predictions, 8);
        assert_eq!(params.sampling.condition_scale, Some(10.0));
        assert_eq!(params.sampling.top_k, None);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn invalid_sampling_is_rejected() {
        let base = SamplingParams::default();
        assert_eq!(
            SamplingParams {
                top_k: Some(0),
                ..base
            }
            .validate(),
            Err(ParamsError::ZeroTopK)
        );
        assert_eq!(
            SamplingParams {
                top_p: Some(1.5),
                ..base
            }
            .validate(),
            Err(ParamsError::TopPOutOfRange(1.5))
        );
        assert!(SamplingParams {
            temperature: Some(0.0),
            ..base
        }
        .validate()
        .is_err());
        assert!(SamplingParams {
            temperature: Some(f32::NAN),
            ..base
        }
        .validate()
        .is_err());
        assert!(SamplingParams {
            top_p: Some(1.0),
            temperature: Some(0.7),
            top_k: Some(50),
            condition_scale: None,
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn from_json() -> anyhow::Result<()> {
        let params: GenerationParams =
            serde_json::from_str(r#"{"seed": 5, "sampling": {"top_k": 64}}"#)?;
        assert_eq!(params.n_predictions, 8);
        assert_eq!(params.sampling.top_k, Some(64));
        assert_eq!(params.sampling.condition_scale, Some(10.0));
        Ok(())
    }
}
