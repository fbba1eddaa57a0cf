use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

/// File name of the bundled default wake-word classifier.
pub const DEFAULT_WAKE_MODEL: &str = "hey_nabu.onnx";
/// Bundled mel-spectrogram frontend graph.
pub const MELSPEC_MODEL: &str = "melspectrogram.onnx";
/// Bundled embedding graph.
pub const EMBEDDING_MODEL: &str = "embedding_model.onnx";

/// Reference to a classifier model, resolved against the bundled or the
/// user model directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelReference {
    BuiltIn(String),
    User(String),
}

impl Default for ModelReference {
    fn default() -> Self {
        ModelReference::BuiltIn(DEFAULT_WAKE_MODEL.to_string())
    }
}

impl ModelReference {
    pub fn name(&self) -> &str {
        match self {
            ModelReference::BuiltIn(name) | ModelReference::User(name) => name,
        }
    }
}

impl fmt::Display for ModelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelReference::BuiltIn(name) => write!(f, "builtin:{name}"),
            ModelReference::User(name) => write!(f, "user:{name}"),
        }
    }
}

impl FromStr for ModelReference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, name) = s.split_once(':').unwrap_or(("builtin", s));
        if name.is_empty() {
            bail!("model reference has an empty name: {s:?}");
        }
        match kind {
            "builtin" => Ok(ModelReference::BuiltIn(name.to_string())),
            "user" => Ok(ModelReference::User(name.to_string())),
            other => bail!("unknown model reference scheme {other:?} in {s:?}"),
        }
    }
}

impl Serialize for ModelReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModelReference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The three session handles the pipeline runs.
pub struct ModelSessions {
    pub melspec: Session,
    pub embedding: Session,
    pub classifier: Session,
}

/// Resolves model references and instantiates ONNX sessions from byte blobs.
pub struct ModelLoader {
    builtin_dir: PathBuf,
    user_dir: PathBuf,
}

impl ModelLoader {
    pub fn new(builtin_dir: impl Into<PathBuf>, user_dir: impl Into<PathBuf>) -> Self {
        Self {
            builtin_dir: builtin_dir.into(),
            user_dir: user_dir.into(),
        }
    }

    pub fn resolve(&self, reference: &ModelReference) -> PathBuf {
        match reference {
            ModelReference::BuiltIn(name) => self.builtin_dir.join(name),
            ModelReference::User(name) => self.user_dir.join(name),
        }
    }

    /// Load the mel, embedding and classifier sessions.
    ///
    /// Mel and embedding graphs come from the bundled directory and are
    /// required. A classifier that cannot be read or instantiated falls back
    /// to the bundled default with a warning.
    pub fn load(&self, reference: &ModelReference) -> Result<ModelSessions> {
        let melspec = self
            .load_session_from(&self.builtin_dir.join(MELSPEC_MODEL))
            .context("failed to load melspectrogram model")?;
        let embedding = self
            .load_session_from(&self.builtin_dir.join(EMBEDDING_MODEL))
            .context("failed to load embedding model")?;

        let classifier = match self.load_session_from(&self.resolve(reference)) {
            Ok(session) => session,
            Err(err) => {
                warn!(
                    model = %reference,
                    error = %format!("{err:#}"),
                    "classifier load failed, falling back to built-in {DEFAULT_WAKE_MODEL}"
                );
                self.load_session_from(&self.builtin_dir.join(DEFAULT_WAKE_MODEL))
                    .context("failed to load fallback classifier model")?
            }
        };

        Ok(ModelSessions {
            melspec,
            embedding,
            classifier,
        })
    }

    /// Check that a candidate model blob instantiates before it is committed
    /// to the user model directory. The ephemeral session is dropped here.
    pub fn validate_blob(&self, bytes: &[u8]) -> Result<()> {
        build_session(bytes).map(|_| ())
    }

    /// Validate and commit a user-supplied classifier blob. A blob that does
    /// not instantiate is rejected and the user directory is left untouched.
    pub fn import_user_model(&self, name: &str, bytes: &[u8]) -> Result<ModelReference> {
        if name.is_empty() || !name.ends_with(".onnx") {
            bail!("user model name must end in .onnx, got {name:?}");
        }
        self.validate_blob(bytes)
            .with_context(|| format!("rejected user model {name}"))?;

        std::fs::create_dir_all(&self.user_dir)
            .with_context(|| format!("failed to create {}", self.user_dir.display()))?;
        let path = self.user_dir.join(name);
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(ModelReference::User(name.to_string()))
    }

    fn load_session_from(&self, path: &Path) -> Result<Session> {
        let bytes =
            std::fs::read(path).with_context(|| format!("unreadable model {}", path.display()))?;
        build_session(&bytes).with_context(|| format!("invalid model {}", path.display()))
    }
}

fn build_session(bytes: &[u8]) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(1)?
        .with_inter_threads(1)?
        .commit_from_memory(bytes)?;
    Ok(session)
}
