use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use dalle_rs_common::{load_safetensors, FileData, FileLoader, ModelSource, ParamStore, TokenSource};
use serde::Deserialize;
use tracing::info;

use crate::{ModelDType, TryIntoDType};

/// A model together with its parameters.
pub struct LoadedModel<M: ?Sized> {
    pub model: Arc<M>,
    pub params: ParamStore,
}

/// Resolves a model identifier to a model handle.
pub trait ModelLoader {
    type Model: ?Sized;

    fn load(
        &self,
        source: &ModelSource,
        revision: Option<String>,
        dtype: ModelDType,
    ) -> anyhow::Result<LoadedModel<Self::Model>>;
}

/// Everything a model constructor may need from a resolved repository.
pub struct ResolvedComponent {
    pub architecture: String,
    pub config: serde_json::Value,
    pub files: HashMap<String, FileData>,
}

impl ResolvedComponent {
    /// Deserialize the model's `config.json` into a typed config.
    pub fn config_as<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.config.clone())?)
    }
}

pub type ModelConstructor<M> =
    Box<dyn Fn(&ResolvedComponent) -> anyhow::Result<Arc<M>> + Send + Sync>;

#[derive(Clone, Debug, Deserialize)]
struct ArchitectureShim {
    architectures: Option<Vec<String>>,
    #[serde(rename = "_class_name")]
    class_name: Option<String>,
    model_type: Option<String>,
}

impl ArchitectureShim {
    fn name(self) -> Option<String> {
        self.architectures
            .and_then(|a| a.into_iter().next())
            .or(self.class_name)
            .or(self.model_type)
    }
}

/// Loads models from Hugging Face repositories or local directories, dispatching on the architecture
/// named in `config.json` to a registered constructor.
pub struct HubLoader<M: ?Sized> {
    constructors: HashMap<String, ModelConstructor<M>>,
    token: TokenSource,
    silent: bool,
}

impl<M: ?Sized> HubLoader<M> {
    pub fn new(token: TokenSource, silent: bool) -> Self {
        Self {
            constructors: HashMap::new(),
            token,
            silent,
        }
    }

    /// Register a constructor for an architecture name, replacing any previous one.
    pub fn register<F>(mut self, architecture: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&ResolvedComponent) -> anyhow::Result<Arc<M>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(architecture.into(), Box::new(constructor));
        self
    }

    pub fn architectures(&self) -> Vec<&str> {
        let mut names = self.constructors.keys().map(|x| x.as_str()).collect::<Vec<_>>();
        names.sort();
        names
    }
}

/// Weights, configs and tokenizer files. Other checkpoint formats are never downloaded.
fn is_model_file(name: &str) -> bool {
    [".safetensors", ".json", ".txt"]
        .iter()
        .any(|ext| name.ends_with(ext))
}

impl<M: ?Sized> ModelLoader for HubLoader<M> {
    type Model = M;

    fn load(
        &self,
        source: &ModelSource,
        revision: Option<String>,
        dtype: ModelDType,
    ) -> anyhow::Result<LoadedModel<M>> {
        if !self.silent {
            info!("loading from source: {source}.");
        }

        let loader = FileLoader::from_model_source(source, self.silent, &self.token, revision)?;
        let files = loader.list_files()?;

        let mut needed = files
            .iter()
            .filter(|f| is_model_file(f))
            .cloned()
            .collect::<Vec<_>>();
        needed.sort();
        if !needed.iter().any(|f| f.ends_with(".safetensors")) {
            anyhow::bail!("Expected at least one `.safetensors` file present.");
        }

        if !files.contains(&"config.json".to_string()) {
            anyhow::bail!("Expected `config.json` file present.");
        }
        let config: serde_json::Value =
            serde_json::from_str(&loader.read_file("config.json")?.read_to_string()?)?;
        let Some(architecture) = serde_json::from_value::<ArchitectureShim>(config.clone())?.name()
        else {
            anyhow::bail!("`config.json` does not name an architecture.");
        };
        let Some(constructor) = self.constructors.get(&architecture) else {
            anyhow::bail!(
                "Unexpected architecture `{architecture}`, expected one of {:?}.",
                self.architectures()
            );
        };

        if !self.silent {
            info!("model architecture is: {architecture}");
        }

        let mut resolved = HashMap::new();
        let mut safetensors = Vec::new();
        for file in &needed {
            let data = loader.read_file(file)?;
            if file.ends_with(".safetensors") {
                safetensors.push(data.clone());
            }
            resolved.insert(file.clone(), data);
        }

        let dtype = dtype.try_into_dtype(self.silent)?;
        let params = load_safetensors(&safetensors, dtype, self.silent)?;
        if !self.silent {
            info!(
                "loaded {} parameters ({} bytes).",
                params.len(),
                params.total_size_in_bytes()
            );
        }

        let component = ResolvedComponent {
            architecture,
            config,
            files: resolved,
        };
        let model = constructor(&component)
            .with_context(|| format!("Could not build `{}` from {source}", component.architecture))?;

        Ok(LoadedModel { model, params })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        fs,
        path::PathBuf,
        sync::{Arc, Mutex},
    };

    use dalle_rs_common::{DType, ModelSource, ParamData, TokenSource};
    use safetensors::{tensor::TensorView, Dtype};
    use serde::Deserialize;

    use super::{HubLoader, ModelLoader};
    use crate::ModelDType;

    #[derive(Debug, Deserialize)]
    struct TinyConfig {
        hidden_size: usize,
    }

    trait Named: Send + Sync {
        fn name(&self) -> String;
    }

    struct Tiny(usize);

    impl Named for Tiny {
        fn name(&self) -> String {
            format!("tiny-{}", self.0)
        }
    }

    fn write_repo(name: &str, config: &str) -> anyhow::Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("dalle_rs_loader_{}_{name}", std::process::id()));
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("config.json"), config)?;
        let data = [1.0f32, 2.0]
            .iter()
            .flat_map(|x| x.to_le_bytes())
            .collect::<Vec<u8>>();
        let view = TensorView::new(Dtype::F32, vec![2], &data)?;
        let bytes = safetensors::serialize([("w", &view)], &None::<HashMap<String, String>>)?;
        fs::write(dir.join("model.safetensors"), bytes)?;
        Ok(dir)
    }

    fn tiny_loader() -> HubLoader<dyn Named> {
        HubLoader::<dyn Named>::new(TokenSource::None, true).register("TinyModel", |c| {
            let cfg: TinyConfig = c.config_as()?;
            Ok(Arc::new(Tiny(cfg.hidden_size)) as Arc<dyn Named>)
        })
    }

    #[test]
    fn loads_registered_architecture() -> anyhow::Result<()> {
        let dir = write_repo("ok", r#"{"architectures": ["TinyModel"], "hidden_size": 3}"#)?;
        let loaded = tiny_loader().load(&ModelSource::local(&dir), None, ModelDType::F16)?;
        assert_eq!(loaded.model.name(), "tiny-3");
        assert_eq!(loaded.params.get("w")?.data.dtype(), Some(DType::F16));
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn class_name_fallback_and_auto_dtype() -> anyhow::Result<()> {
        let dir = write_repo("class", r#"{"_class_name": "TinyModel", "hidden_size": 5}"#)?;
        let loaded = tiny_loader().load(&ModelSource::local(&dir), None, ModelDType::Auto)?;
        assert_eq!(loaded.model.name(), "tiny-5");
        assert_eq!(loaded.params.get("w")?.data, ParamData::F32(vec![1.0, 2.0]));
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn unknown_architecture_fails() -> anyhow::Result<()> {
        let dir = write_repo("unknown", r#"{"architectures": ["Other"]}"#)?;
        let err = tiny_loader()
            .load(&ModelSource::local(&dir), None, ModelDType::Auto)
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("Unexpected architecture `Other`"), "{err}");
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    struct Files(String);

    impl Named for Files {
        fn name(&self) -> String {
            self.0.clone()
        }
    }

    #[test]
    fn other_checkpoint_formats_are_skipped() -> anyhow::Result<()> {
        let dir = write_repo("formats", r#"{"architectures": ["FilesModel"]}"#)?;
        fs::write(dir.join("pytorch_model.bin"), [0u8; 4])?;
        fs::write(dir.join("flax_model.msgpack"), [0u8; 4])?;
        fs::write(dir.join("tokenizer.json"), "{}")?;
        let loader = HubLoader::<dyn Named>::new(TokenSource::None, true).register("FilesModel", |c| {
            let mut names = c.files.keys().cloned().collect::<Vec<_>>();
            names.sort();
            Ok(Arc::new(Files(names.join(","))) as Arc<dyn Named>)
        });
        let loaded = loader.load(&ModelSource::local(&dir), None, ModelDType::Auto)?;
        assert_eq!(
            loaded.model.name(),
            "config.json,model.safetensors,tokenizer.json"
        );
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn repo_without_safetensors_fails() -> anyhow::Result<()> {
        let dir = write_repo("no_st", r#"{"architectures": ["TinyModel"], "hidden_size": 1}"#)?;
        fs::remove_file(dir.join("model.safetensors"))?;
        fs::write(dir.join("pytorch_model.bin"), [0u8; 4])?;
        let err = tiny_loader()
            .load(&ModelSource::local(&dir), None, ModelDType::Auto)
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains(".safetensors"), "{err}");
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .map_err(|_| std::io::Error::other("poisoned"))?
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn logged_while_loading(silent: bool) -> anyhow::Result<String> {
        let dir = write_repo(
            &format!("log_{silent}"),
            r#"{"architectures": ["TinyModel"], "hidden_size": 2}"#,
        )?;
        let loader = HubLoader::<dyn Named>::new(TokenSource::None, silent).register(
            "TinyModel",
            |_| Ok(Arc::new(Tiny(2)) as Arc<dyn Named>),
        );
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            loader.load(&ModelSource::local(&dir), None, ModelDType::Auto)
        })?;
        fs::remove_dir_all(dir)?;
        let bytes = capture.0.lock().map(|b| b.clone()).unwrap_or_default();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    #[test]
    fn silent_loading_logs_nothing() -> anyhow::Result<()> {
        assert_eq!(logged_while_loading(true)?, "");
        assert!(logged_while_loading(false)?.contains("loading from source"));
        Ok(())
    }

    #[test]
    fn missing_config_fails() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("dalle_rs_loader_{}_empty", std::process::id()));
        fs::create_dir_all(&dir)?;
        assert!(tiny_loader()
            .load(&ModelSource::local(&dir), None, ModelDType::Auto)
            .is_err());
        fs::remove_dir_all(dir)?;
        Ok(())
    }
}
