//! On-disk identity dataset: one directory per identity under a root,
//! each holding `jpg`/`jpeg`/`png` sample images.

use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use image::ImageFormat;
use thiserror::Error;

use crate::wire::RegisteredUser;

const SAMPLE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("invalid identity name: {0}")]
    InvalidName(String),
    #[error("image could not be decoded: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("dataset I/O failed while {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: io::Error,
    },
}

impl DatasetError {
    fn io(action: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| DatasetError::Io { action, source }
    }
}

/// An identity directory and its sample images, sorted by file name.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub name: String,
    pub images: Vec<PathBuf>,
}

impl IdentityRecord {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

/// Result of storing one registration image.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub path: PathBuf,
    /// Images held by the identity after the write.
    pub image_count: usize,
}

/// Filesystem-backed identity store.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All identity directories, sorted by name. A missing root is an empty dataset.
    pub fn identities(&self) -> Result<Vec<IdentityRecord>, DatasetError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DatasetError::io("listing identities")(e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(DatasetError::io("listing identities"))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!(path = %path.display(), "skipping identity with non UTF-8 name");
                continue;
            };
            let images = sample_images(&path)?;
            records.push(IdentityRecord {
                name: name.to_string(),
                images,
            });
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Registered identities with their image counts.
    pub fn users(&self) -> Result<Vec<RegisteredUser>, DatasetError> {
        Ok(self
            .identities()?
            .into_iter()
            .map(|record| RegisteredUser {
                image_count: record.image_count(),
                name: record.name,
            })
            .collect())
    }

    /// Decode `image_bytes` and store it as the next `img_<n>.jpg` of `name`.
    ///
    /// The identity directory is created on first registration. File creation
    /// is exclusive, so concurrent registrations never overwrite each other.
    pub fn register(&self, name: &str, image_bytes: &[u8]) -> Result<StoredImage, DatasetError> {
        validate_identity_name(name)?;
        let image = image::load_from_memory(image_bytes)?;
        let rgb = image::DynamicImage::ImageRgb8(image.to_rgb8());

        let dir = self.root.join(name);
        fs::create_dir_all(&dir).map_err(DatasetError::io("creating identity directory"))?;

        let mut index = sample_images(&dir)?.len();
        let (path, file) = loop {
            let candidate = dir.join(format!("img_{index}.jpg"));
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(file) => break (candidate, file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => index += 1,
                Err(e) => return Err(DatasetError::io("creating image file")(e)),
            }
        };

        let mut writer = BufWriter::new(file);
        let written = rgb
            .write_to(&mut writer, ImageFormat::Jpeg)
            .map_err(DatasetError::from)
            .and_then(|()| writer.flush().map_err(DatasetError::io("writing image file")));
        drop(writer);
        if let Err(e) = written {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        let image_count = sample_images(&dir)?.len();
        tracing::info!(identity = name, path = %path.display(), image_count, "stored sample image");
        Ok(StoredImage { path, image_count })
    }
}

/// Identity names double as directory names.
pub fn validate_identity_name(name: &str) -> Result<(), DatasetError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DatasetError::InvalidName("name must not be empty".into()));
    }
    if trimmed != name {
        return Err(DatasetError::InvalidName(
            "name must not start or end with whitespace".into(),
        ));
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(DatasetError::InvalidName(format!(
            "{name:?} is not usable as a directory name"
        )));
    }
    Ok(())
}

fn is_sample_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SAMPLE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

fn sample_images(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).map_err(DatasetError::io("listing sample images"))? {
        let path = entry.map_err(DatasetError::io("listing sample images"))?.path();
        if path.is_file() && is_sample_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}
