use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hf_hub::api::tokio::{Api, ApiError, ApiRepo};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

/// Where a model artifact is read from: a local directory (the storage
/// initializer mounts models at `/mnt/models`) or a hub repository.
pub enum ModelSource {
    Local(PathBuf),
    Hub { id: String, repo: ApiRepo },
}

#[derive(Deserialize)]
struct WeightIndex {
    weight_map: HashMap<String, String>,
}

// Only a 404 says the file is absent; every other failure is real.
fn is_not_found(err: &ApiError) -> bool {
    match err {
        ApiError::RequestError(e) => e.status().is_some_and(|status| status.as_u16() == 404),
        _ => false,
    }
}

fn join(dir: &str, file: &str) -> String {
    if dir.is_empty() {
        file.to_string()
    } else {
        format!("{dir}/{file}")
    }
}

impl ModelSource {
    /// Existing directories are read locally. Anything else that looks like
    /// a filesystem path is an error; the rest is treated as a repo id.
    pub fn resolve(model_id: &str) -> Result<Self> {
        let path = Path::new(model_id);
        if path.is_dir() {
            return Ok(Self::Local(path.to_path_buf()));
        }
        if path.exists() || path.is_absolute() || model_id.starts_with('.') {
            bail!("model directory {model_id} does not exist");
        }
        let api = Api::new().context("failed to create hf hub API")?;
        Ok(Self::Hub {
            id: model_id.to_string(),
            repo: api.model(model_id.to_string()),
        })
    }

    /// Fetches a file the model cannot load without.
    pub async fn get(&self, file: &str) -> Result<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(file);
                if !path.is_file() {
                    bail!("missing model file {}", path.display());
                }
                Ok(path)
            }
            Self::Hub { id, repo } => repo
                .get(file)
                .await
                .with_context(|| format!("failed to fetch {file} from {id}")),
        }
    }

    /// Fetches a file the model may not ship. `None` when it is absent.
    pub async fn try_get(&self, file: &str) -> Result<Option<PathBuf>> {
        match self {
            Self::Local(dir) => Ok(Some(dir.join(file)).filter(|path| path.is_file())),
            Self::Hub { id, repo } => match repo.get(file).await {
                Ok(path) => Ok(Some(path)),
                Err(e) if is_not_found(&e) => {
                    debug!("{file} not available from {id}: {e}");
                    Ok(None)
                }
                Err(e) => Err(e).with_context(|| format!("failed to fetch {file} from {id}")),
            },
        }
    }

    /// Fetches `file`, or `fallback_file` from the `fallback_repo` hub
    /// repository when the model does not ship it.
    pub async fn get_with_fallback(
        &self,
        file: &str,
        fallback_repo: &str,
        fallback_file: &str,
    ) -> Result<PathBuf> {
        if let Some(path) = self.try_get(file).await? {
            return Ok(path);
        }
        debug!("{file} not found in {self}, falling back to {fallback_repo}");
        Api::new()
            .context("failed to create hf hub API")?
            .model(fallback_repo.to_string())
            .get(fallback_file)
            .await
            .with_context(|| format!("failed to fetch {fallback_file} from {fallback_repo}"))
    }

    /// Reads and parses an optional JSON file.
    pub async fn read_json<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        let Some(path) = self.try_get(file).await? else {
            return Ok(None);
        };
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    /// Resolves `{dir}/{stem}.safetensors`, or every shard listed by
    /// `{dir}/{stem}.safetensors.index.json` when the weights are sharded.
    pub async fn get_weights(&self, dir: &str, stem: &str) -> Result<Vec<PathBuf>> {
        let index_file = join(dir, &format!("{stem}.safetensors.index.json"));
        if let Some(index) = self.read_json::<WeightIndex>(&index_file).await? {
            let shards: BTreeSet<&String> = index.weight_map.values().collect();
            if shards.is_empty() {
                bail!("{index_file} lists no weight shards");
            }
            let mut files = Vec::with_capacity(shards.len());
            for shard in shards {
                files.push(self.get(&join(dir, shard)).await?);
            }
            return Ok(files);
        }
        Ok(vec![self.get(&join(dir, &format!("{stem}.safetensors"))).await?])
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(dir) => write!(f, "{}", dir.display()),
            Self::Hub { id, .. } => write!(f, "hub:{id}"),
        }
    }
}
