//! Loading model parameters from `.safetensors` files into a host-side [`ParamStore`].

use std::{collections::HashMap, fmt::Display, fs::File};

use byteorder::{ByteOrder, LittleEndian};
use half::{bf16, f16};
use memmap2::Mmap;
use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use serde::Deserialize;
use tracing::debug;

use crate::{FileData, NiceProgressBar};

/// Floating point precision of stored parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum DType {
    #[serde(rename = "bf16")]
    BF16,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "f32")]
    F32,
}

impl Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BF16 => write!(f, "bf16"),
            Self::F16 => write!(f, "f16"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

/// Parameter values. Integer buffers (for instance position ids) are never cast.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamData {
    BF16(Vec<bf16>),
    F16(Vec<f16>),
    F32(Vec<f32>),
    I64(Vec<i64>),
}

impl ParamData {
    pub fn len(&self) -> usize {
        match self {
            Self::BF16(x) => x.len(),
            Self::F16(x) => x.len(),
            Self::F32(x) => x.len(),
            Self::I64(x) => x.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The float precision, `None` for integer data.
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Self::BF16(_) => Some(DType::BF16),
            Self::F16(_) => Some(DType::F16),
            Self::F32(_) => Some(DType::F32),
            Self::I64(_) => None,
        }
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Self::BF16(x) => x.iter().map(|v| v.to_f32()).collect(),
            Self::F16(x) => x.iter().map(|v| v.to_f32()).collect(),
            Self::F32(x) => x.clone(),
            #[allow(clippy::cast_precision_loss)]
            Self::I64(x) => x.iter().map(|v| *v as f32).collect(),
        }
    }

    /// Cast float data to `dtype`.
    pub fn to_dtype(self, dtype: DType) -> Self {
        if matches!(self, Self::I64(_)) || self.dtype() == Some(dtype) {
            return self;
        }
        let values = self.to_f32_vec();
        match dtype {
            DType::BF16 => Self::BF16(values.into_iter().map(bf16::from_f32).collect()),
            DType::F16 => Self::F16(values.into_iter().map(f16::from_f32).collect()),
            DType::F32 => Self::F32(values),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub data: ParamData,
}

impl ParamTensor {
    pub fn new(shape: Vec<usize>, data: ParamData) -> anyhow::Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            anyhow::bail!(
                "Shape {shape:?} has {numel} elements but {} values were given.",
                data.len()
            );
        }
        Ok(Self { shape, data })
    }
}

/// Named, immutable model parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamStore {
    tensors: HashMap<String, ParamTensor>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ParamTensor) -> Option<ParamTensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> anyhow::Result<&ParamTensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Parameter `{name}` is missing."))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|x| x.as_str())
    }

    /// The precision of the first float tensor in name order.
    pub fn dtype(&self) -> Option<DType> {
        let mut names = self.tensors.keys().collect::<Vec<_>>();
        names.sort();
        names
            .into_iter()
            .find_map(|name| self.tensors[name].data.dtype())
    }

    pub fn total_size_in_bytes(&self) -> usize {
        self.tensors
            .values()
            .map(|t| match &t.data {
                ParamData::BF16(x) => x.len() * 2,
                ParamData::F16(x) => x.len() * 2,
                ParamData::F32(x) => x.len() * 4,
                ParamData::I64(x) => x.len() * 8,
            })
            .sum()
    }
}

fn convert_view(view: &TensorView<'_>) -> anyhow::Result<ParamData> {
    let bytes = view.data();
    let data = match view.dtype() {
        Dtype::F32 => {
            let mut out = vec![0f32; bytes.len() / 4];
            LittleEndian::read_f32_into(bytes, &mut out);
            ParamData::F32(out)
        }
        Dtype::F16 => ParamData::F16(
            bytes
                .chunks_exact(2)
                .map(|b| f16::from_le_bytes([b[0], b[1]]))
                .collect(),
        ),
        Dtype::BF16 => ParamData::BF16(
            bytes
                .chunks_exact(2)
                .map(|b| bf16::from_le_bytes([b[0], b[1]]))
                .collect(),
        ),
        Dtype::I64 => {
            let mut out = vec![0i64; bytes.len() / 8];
            LittleEndian::read_i64_into(bytes, &mut out);
            ParamData::I64(out)
        }
        other => anyhow::bail!("Unsupported safetensors dtype `{other:?}`."),
    };
    Ok(data)
}

/// Load every tensor of the given files. Float tensors are cast to `dtype` if it is given.
/// Set `silent` to not show a progress bar.
pub fn load_safetensors(
    files: &[FileData],
    dtype: Option<DType>,
    silent: bool,
) -> anyhow::Result<ParamStore> {
    let mut store = ParamStore::new();
    for file in files {
        match file.extension().and_then(|x| x.to_str()) {
            Some("safetensors") => (),
            other => anyhow::bail!("Unexpected extension `{other:?}` for {file:?}."),
        }
        let handle = File::open(file.path())?;
        let mmap = unsafe { Mmap::map(&handle)? };
        let tensors = SafeTensors::deserialize(&mmap)?;
        let mut names = tensors.names().into_iter().cloned().collect::<Vec<_>>();
        names.sort();

        debug!("loading {} tensors from {file:?}", names.len());
        for name in NiceProgressBar::<_, 'g'>::new(names.into_iter(), "Loading tensors", silent) {
            let view = tensors.tensor(&name)?;
            let mut data = convert_view(&view)?;
            if let Some(dtype) = dtype {
                data = data.to_dtype(dtype);
            }
            let tensor = ParamTensor::new(view.shape().to_vec(), data)?;
            if store.insert(name.clone(), tensor).is_some() {
                anyhow::bail!("Parameter `{name}` is defined in more than one file.");
            }
        }
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs};

    use half::f16;
    use safetensors::{tensor::TensorView, Dtype};

    use super::{load_safetensors, DType, ParamData, ParamTensor};
    use crate::FileData;

    fn write_checkpoint(name: &str) -> anyhow::Result<FileData> {
        let dir = std::env::temp_dir().join(format!("dalle_rs_st_{}_{name}", std::process::id()));
        fs::create_dir_all(&dir)?;

        let weight = [1.5f32, -2.0, 0.25, 4.0]
            .iter()
            .flat_map(|x| x.to_le_bytes())
            .collect::<Vec<u8>>();
        let bias = [f16::from_f32(0.5), f16::from_f32(-1.0)]
            .iter()
            .flat_map(|x| x.to_le_bytes())
            .collect::<Vec<u8>>();
        let ids = [0i64, 1, 2]
            .iter()
            .flat_map(|x| x.to_le_bytes())
            .collect::<Vec<u8>>();

        let weight = TensorView::new(Dtype::F32, vec![2, 2], &weight)?;
        let bias = TensorView::new(Dtype::F16, vec![2], &bias)?;
        let ids = TensorView::new(Dtype::I64, vec![3], &ids)?;
        let bytes = safetensors::serialize(
            [
                ("linear.weight", &weight),
                ("linear.bias", &bias),
                ("position_ids", &ids),
            ],
            &None::<HashMap<String, String>>,
        )?;
        let path = dir.join("model.safetensors");
        fs::write(&path, bytes)?;
        Ok(FileData::new(path))
    }

    #[test]
    fn load_keeps_stored_precision() -> anyhow::Result<()> {
        let file = write_checkpoint("keep")?;
        let store = load_safetensors(&[file], None, true)?;
        assert_eq!(store.len(), 3);
        let weight = store.get("linear.weight")?;
        assert_eq!(weight.shape, vec![2, 2]);
        assert_eq!(weight.data, ParamData::F32(vec![1.5, -2.0, 0.25, 4.0]));
        assert_eq!(store.get("linear.bias")?.data.dtype(), Some(DType::F16));
        assert_eq!(store.get("position_ids")?.data, ParamData::I64(vec![0, 1, 2]));
        assert_eq!(store.dtype(), Some(DType::F16));
        assert!(store.get("missing").is_err());
        Ok(())
    }

    #[test]
    fn load_casts_floats_only() -> anyhow::Result<()> {
        let file = write_checkpoint("cast")?;
        let store = load_safetensors(&[file], Some(DType::F32), true)?;
        assert_eq!(
            store.get("linear.bias")?.data,
            ParamData::F32(vec![0.5, -1.0])
        );
        assert_eq!(store.get("position_ids")?.data, ParamData::I64(vec![0, 1, 2]));
        assert_eq!(store.total_size_in_bytes(), 4 * 4 + 2 * 4 + 3 * 8);
        Ok(())
    }

    #[test]
    fn duplicate_names_across_files_fail() -> anyhow::Result<()> {
        let a = write_checkpoint("dup_a")?;
        let b = write_checkpoint("dup_b")?;
        assert!(load_safetensors(&[a, b], None, true).is_err());
        Ok(())
    }

    #[test]
    fn shape_must_match_data() {
        assert!(ParamTensor::new(vec![2, 3], ParamData::F32(vec![0.0; 5])).is_err());
        assert!(ParamTensor::new(vec![], ParamData::F32(vec![1.0])).is_ok());
    }
}
