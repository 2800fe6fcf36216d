mod mesh;
mod model_source;
mod prng;
mod progress;
mod safetensors;
mod tokenizer;
mod tokens;

pub use mesh::{Device, DeviceMesh, MeshError, Replicated, Sharded, DEVICES_ENV_VAR};
pub use model_source::*;
pub use prng::PrngKey;
pub use progress::NiceProgressBar;
pub use safetensors::{load_safetensors, DType, ParamData, ParamStore, ParamTensor};
pub use tokenizer::load_tokenizer;
pub use tokens::get_token;
pub use tokens::{TokenSource, TokenSourceError};
