use dalle_rs_common::{DeviceMesh, ParamStore, Replicated, Sharded};
use image::RgbImage;

use crate::models::ImageTokenDecoder;

pub(crate) struct DecodeStage<'a> {
    pub mesh: &'a DeviceMesh,
    pub model: &'a dyn ImageTokenDecoder,
    pub params: &'a Replicated<ParamStore>,
}

impl DecodeStage<'_> {
    /// Decode every device's token batch and flatten the images device-major.
    pub fn run(&self, tokens: Sharded<Vec<Vec<u32>>>) -> anyhow::Result<Vec<RgbImage>> {
        let images = self.mesh.pmap(tokens, |device, tokens| {
            let params = self
                .params
                .get(device.ordinal())
                .ok_or_else(|| anyhow::anyhow!("No decoder parameters on {device}."))?;
            let pixels = self.model.decode(params, &tokens)?;
            if pixels.len() != tokens.len() {
                anyhow::bail!(
                    "Decoder returned {} images for {} sequences on {device}.",
                    pixels.len(),
                    tokens.len()
                );
            }
            pixels
                .iter()
                .map(|p| p.to_rgb8())
                .collect::<anyhow::Result<Vec<_>>>()
        })?;
        Ok(images.flatten())
    }
}
