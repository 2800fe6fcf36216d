use std::{
    ffi::OsStr,
    fmt::{Debug, Display},
    fs,
    path::{Path, PathBuf},
};

use crate::{get_token, TokenSource};
use hf_hub::{
    api::sync::{ApiBuilder, ApiRepo},
    Repo, RepoType,
};
use tracing::debug;

/// Source from which to load a model. This is easiest to create with the various constructor functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    ModelId(String),
    Local(PathBuf),
}

impl Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelId(model_id) => write!(f, "model id: {model_id}"),
            Self::Local(path) => write!(f, "local directory: {}", path.display()),
        }
    }
}

impl ModelSource {
    /// Load the model from a Hugging Face model ID or a local path.
    ///
    /// If `model_id` names an existing directory, the files are read from there.
    pub fn from_model_id<S: ToString>(model_id: S) -> Self {
        let model_id = model_id.to_string();
        if Path::new(&model_id).is_dir() {
            Self::Local(PathBuf::from(model_id))
        } else {
            Self::ModelId(model_id)
        }
    }

    /// Load the model from a local directory laid out like a Hugging Face repository.
    pub fn local<P: AsRef<Path>>(path: P) -> Self {
        Self::Local(path.as_ref().to_path_buf())
    }
}

pub enum FileLoader {
    Api(Box<ApiRepo>),
    Local(PathBuf),
}

impl FileLoader {
    /// Resolve a model source.
    ///
    /// `revision` is only applicable to Hugging Face models and defaults to `main`.
    pub fn from_model_source(
        source: &ModelSource,
        silent: bool,
        token: &TokenSource,
        revision: Option<String>,
    ) -> anyhow::Result<Self> {
        match source {
            ModelSource::ModelId(model_id) => {
                let api_builder = ApiBuilder::new()
                    .with_progress(!silent)
                    .with_token(get_token(token)?)
                    .build()?;
                let revision = revision.unwrap_or("main".to_string());
                let api = api_builder.repo(Repo::with_revision(
                    model_id.clone(),
                    RepoType::Model,
                    revision,
                ));

                Ok(Self::Api(Box::new(api)))
            }
            ModelSource::Local(path) => {
                if !path.is_dir() {
                    anyhow::bail!("Local model source `{}` is not a directory.", path.display());
                }
                if revision.is_some() {
                    debug!("ignoring revision for local model source {}", path.display());
                }
                Ok(Self::Local(path.clone()))
            }
        }
    }

    /// List all files, with paths relative to the repository root and `/` as separator.
    pub fn list_files(&self) -> anyhow::Result<Vec<String>> {
        match self {
            Self::Api(api) => api
                .info()
                .map(|repo| {
                    repo.siblings
                        .iter()
                        .map(|x| x.rfilename.clone())
                        .collect::<Vec<String>>()
                })
                .map_err(|e| anyhow::Error::msg(e.to_string())),
            Self::Local(root) => {
                let mut files = Vec::new();
                list_dir_recursive(root, root, &mut files)?;
                files.sort();
                Ok(files)
            }
        }
    }

    /// Read a file. For hub sources this downloads into (or reuses) the local cache.
    pub fn read_file(&self, name: &str) -> anyhow::Result<FileData> {
        match self {
            Self::Api(api) => Ok(FileData::new(
                api.get(name)
                    .map_err(|e| anyhow::Error::msg(e.to_string()))?,
            )),
            Self::Local(root) => {
                let path = root.join(name);
                if !path.is_file() {
                    anyhow::bail!("File `{name}` not found in {}.", root.display());
                }
                Ok(FileData::new(path))
            }
        }
    }
}

fn list_dir_recursive(root: &Path, dir: &Path, out: &mut Vec<String>) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            list_dir_recursive(root, &path, out)?;
        } else {
            let rel = path.strip_prefix(root)?;
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push(name);
        }
    }
    Ok(())
}

/// A resolved file on local disk.
#[derive(Clone, PartialEq, Eq)]
pub struct FileData {
    path: PathBuf,
}

impl Debug for FileData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "path: {}", self.path.display())
    }
}

impl FileData {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_to_string(&self) -> anyhow::Result<String> {
        Ok(fs::read_to_string(&self.path)?)
    }

    pub fn extension(&self) -> Option<&OsStr> {
        self.path.extension()
    }
}
