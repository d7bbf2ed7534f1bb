use std::{
    borrow::Cow,
    ffi::OsStr,
    fmt::{Debug, Display},
    fs::{self, File},
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{get_token, TokenSource};
use anyhow::Context;
use hf_hub::{
    api::sync::{ApiBuilder, ApiRepo},
    Repo, RepoType,
};
use memmap2::Mmap;
use walkdir::WalkDir;
use zip::{CompressionMethod, ZipArchive};

/// Packed single-file formats a [`ModelSource::SingleFile`] may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedFormat {
    /// A zip archive with stored (uncompressed) entries laid out like a diffusers directory.
    Dduf,
    /// One `.safetensors` file with the original (SGM) tensor layout.
    Checkpoint,
}

/// Source from which to load the model. This is easiest to create with the various constructor functions.
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// A diffusers-format directory on disk.
    Directory(PathBuf),
    /// A single packed weights file.
    SingleFile(PathBuf),
    /// A Hugging Face model ID.
    ModelId(String),
}

impl Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Directory(path) => write!(f, "directory: {}", path.display()),
            Self::SingleFile(path) => write!(f, "single file: {}", path.display()),
            Self::ModelId(model_id) => write!(f, "model id: {model_id}"),
        }
    }
}

impl ModelSource {
    /// Classify a local path: directories are structured pipelines, anything else is treated as a single
    /// packed weights file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.is_dir() {
            Self::Directory(path.to_path_buf())
        } else {
            Self::SingleFile(path.to_path_buf())
        }
    }

    /// Load from a Hugging Face model ID, or from a local directory if one exists at that path.
    pub fn from_model_id<S: ToString>(model_id: S) -> Self {
        let model_id = model_id.to_string();
        if Path::new(&model_id).is_dir() {
            Self::Directory(PathBuf::from(model_id))
        } else {
            Self::ModelId(model_id)
        }
    }

    /// Which packed format a single file holds, judged by its extension.
    pub fn packed_format(&self) -> Option<PackedFormat> {
        let Self::SingleFile(path) = self else {
            return None;
        };
        match path
            .extension()
            .and_then(OsStr::to_str)
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("dduf") => Some(PackedFormat::Dduf),
            Some("safetensors") => Some(PackedFormat::Checkpoint),
            _ => None,
        }
    }
}

/// A memory map shared between a DDUF archive reader and the file data handed out from it.
#[derive(Clone)]
pub struct SharedMmap(Arc<Mmap>);

impl SharedMmap {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self(Arc::new(mmap)))
    }
}

impl AsRef<[u8]> for SharedMmap {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

pub enum FileLoader {
    Api(Box<ApiRepo>),
    Local(PathBuf),
    Dduf {
        archive: ZipArchive<Cursor<SharedMmap>>,
        mmap: SharedMmap,
    },
}

impl FileLoader {
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
            ModelSource::Directory(path) => {
                if !path.is_dir() {
                    anyhow::bail!("Expected `{}` to be a directory.", path.display());
                }
                Ok(Self::Local(path.clone()))
            }
            ModelSource::SingleFile(path) => {
                if source.packed_format() != Some(PackedFormat::Dduf) {
                    anyhow::bail!(
                        "Expected a `.dduf` archive, got `{}`. Other single files are not file-addressable.",
                        path.display()
                    );
                }
                let mmap = SharedMmap::open(path)?;
                let archive = ZipArchive::new(Cursor::new(mmap.clone()))?;
                Ok(Self::Dduf { archive, mmap })
            }
        }
    }

    /// List the files of the source as `/`-separated paths relative to its root.
    pub fn list_files(&mut self) -> anyhow::Result<Vec<String>> {
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
                for entry in WalkDir::new(&*root).sort_by_file_name() {
                    let entry = entry?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let relative = entry.path().strip_prefix(&*root)?;
                    let parts = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>();
                    files.push(parts.join("/"));
                }
                Ok(files)
            }
            Self::Dduf { archive, .. } => (0..archive.len())
                .map(|i| {
                    archive
                        .by_index(i)
                        .map(|x| x.name().to_string())
                        .map_err(|e| anyhow::Error::msg(e.to_string()))
                })
                .collect::<anyhow::Result<Vec<_>>>(),
        }
    }

    /// Read a file.
    ///
    /// - If loading from a DDUF file, this returns a view into the mapped archive instead of owned data.
    /// - For hub sources the file is downloaded (or taken from the cache) and a path is returned.
    pub fn read_file(&mut self, name: &str) -> anyhow::Result<FileData> {
        match self {
            Self::Api(api) => Ok(FileData::Path(
                api.get(name)
                    .map_err(|e| anyhow::Error::msg(e.to_string()))?,
            )),
            Self::Local(root) => {
                let path = root.join(name);
                if !path.is_file() {
                    anyhow::bail!("Expected file `{}` to exist.", path.display());
                }
                Ok(FileData::Path(path))
            }
            Self::Dduf { archive, mmap } => {
                let file = archive.by_name(name)?;
                if file.compression() != CompressionMethod::Stored {
                    anyhow::bail!("DDUF entry `{name}` must be stored without compression.");
                }
                let start = file.data_start() as usize;
                let end = start + file.size() as usize;
                Ok(FileData::Dduf {
                    name: PathBuf::from(file.name()),
                    data: mmap.clone(),
                    start,
                    end,
                })
            }
        }
    }
}

pub enum FileData {
    Path(PathBuf),
    Dduf {
        name: PathBuf,
        data: SharedMmap,
        start: usize,
        end: usize,
    },
}

impl Debug for FileData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(p) => write!(f, "path: {}", p.display()),
            Self::Dduf { name, .. } => write!(f, "dduf: {}", name.display()),
        }
    }
}

impl FileData {
    pub fn name(&self) -> &Path {
        match self {
            Self::Path(p) => p,
            Self::Dduf { name, .. } => name,
        }
    }

    /// The raw bytes. Borrowed from the archive for DDUF entries, read from disk otherwise.
    pub fn bytes(&self) -> anyhow::Result<Cow<'_, [u8]>> {
        match self {
            Self::Path(p) => Ok(Cow::Owned(fs::read(p)?)),
            Self::Dduf {
                name,
                data,
                start,
                end,
            } => {
                let bytes = data.as_ref().get(*start..*end).with_context(|| {
                    format!(
                        "DDUF entry `{}` spans bytes {start}..{end}, past the end of the archive.",
                        name.display()
                    )
                })?;
                Ok(Cow::Borrowed(bytes))
            }
        }
    }

    pub fn read_to_string(&self) -> anyhow::Result<String> {
        match self {
            Self::Path(p) => Ok(fs::read_to_string(p)?),
            Self::Dduf { .. } => Ok(String::from_utf8(self.bytes()?.into_owned())?),
        }
    }

    pub fn extension(&self) -> Option<&OsStr> {
        self.name().extension()
    }
}
