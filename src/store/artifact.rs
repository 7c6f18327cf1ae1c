use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};
use thiserror::Error;

/// Encoded format of saved crops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactFormat {
    Jpeg,
    Png,
}

impl ArtifactFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }

    fn image_format(self) -> ImageFormat {
        match self {
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Png => ImageFormat::Png,
        }
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact encode error: {0}")]
    Encode(#[from] image::ImageError),
    #[error("cannot crop detection: {0}")]
    Crop(String),
}

/// Requested artifact does not exist or the name is not a valid artifact name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("artifact not found: {0}")]
pub struct NotFound(pub String);

/// Parsed `frame_{frame_id}_{label}.{ext}` name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactName {
    pub frame_id: u64,
    pub label: String,
    pub extension: String,
}

impl ArtifactName {
    /// Strict parse; anything that could escape the directory is rejected.
    pub fn parse(name: &str) -> Option<Self> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\', '\0'])
            || name.contains("..")
        {
            return None;
        }
        let (stem, extension) = name.rsplit_once('.')?;
        if ArtifactFormat::parse(extension).is_none() {
            return None;
        }
        let rest = stem.strip_prefix("frame_")?;
        let (id, label) = rest.split_once('_')?;
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if label.is_empty() || sanitize_label(label) != label {
            return None;
        }
        Some(Self {
            frame_id: id.parse().ok()?,
            label: label.to_string(),
            extension: extension.to_string(),
        })
    }
}

/// Lowercase, spaces to `_`, keep `[a-z0-9_-]` only.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        "object".to_string()
    } else {
        cleaned
    }
}

pub fn artifact_file_name(frame_id: u64, label: &str, format: ArtifactFormat) -> String {
    format!(
        "frame_{}_{}.{}",
        frame_id,
        sanitize_label(label),
        format.extension()
    )
}

pub fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').and_then(|(_, ext)| ArtifactFormat::parse(ext)) {
        Some(ArtifactFormat::Png) => "image/png",
        Some(ArtifactFormat::Jpeg) => "image/jpeg",
        None => "application/octet-stream",
    }
}

/// Writer side of the artifact directory. Create-only: files are written
/// under a hidden temporary name and renamed into place, so readers see a
/// complete image or nothing.
pub struct ArtifactStore {
    dir: PathBuf,
    format: ArtifactFormat,
}

impl ArtifactStore {
    pub fn open(dir: impl Into<PathBuf>, format: ArtifactFormat) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, format })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn format(&self) -> ArtifactFormat {
        self.format
    }

    /// Read-only view for concurrent consumers.
    pub fn reader(&self) -> ArtifactReader {
        ArtifactReader::new(self.dir.clone())
    }

    /// Encode and persist `image`; returns the artifact name.
    ///
    /// Names are keyed by `(frame_id, label)`, so a second crop with the same
    /// label in the same frame replaces the first.
    pub fn save(&self, frame_id: u64, label: &str, image: &RgbImage) -> Result<String, ArtifactError> {
        let name = artifact_file_name(frame_id, label, self.format);
        let final_path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!(".{}.tmp", name));

        let written = (|| -> Result<(), ArtifactError> {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            image.write_to(&mut writer, self.format.image_format())?;
            let file = writer
                .into_inner()
                .map_err(|e| ArtifactError::Io(e.into_error()))?;
            file.sync_all()?;
            fs::rename(&tmp_path, &final_path)?;
            Ok(())
        })();

        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        written.map(|()| name)
    }
}

/// Reader side of the artifact directory. Cheap to clone; never locks.
#[derive(Clone, Debug)]
pub struct ArtifactReader {
    dir: PathBuf,
}

impl ArtifactReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Newest first by frame id, at most `limit` names.
    ///
    /// A snapshot of the directory at call time; artifacts written during
    /// the listing may or may not appear.
    pub fn list_recent(&self, limit: usize) -> std::io::Result<Vec<String>> {
        let mut found: Vec<(u64, String)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let Ok(entry) = entry else {
                continue;
            };
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if let Some(parsed) = ArtifactName::parse(&name) {
                found.push((parsed.frame_id, name));
            }
        }
        found.sort_by(|a, b| b.cmp(a));
        found.truncate(limit);
        Ok(found.into_iter().map(|(_, name)| name).collect())
    }

    /// Full bytes of a named artifact.
    pub fn fetch(&self, name: &str) -> Result<Vec<u8>, NotFound> {
        let path = self.path_for(name).ok_or_else(|| NotFound(name.to_string()))?;
        fs::read(path).map_err(|_| NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.path_for(name).is_some_and(|path| path.is_file())
    }

    /// Path for a validated name; `None` for anything that is not an
    /// artifact name.
    pub fn path_for(&self, name: &str) -> Option<PathBuf> {
        ArtifactName::parse(name).map(|_| self.dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tiny_image() -> RgbImage {
        RgbImage::from_pixel(4, 3, image::Rgb([200, 10, 10]))
    }

    #[test]
    fn names_follow_frame_label_convention() {
        assert_eq!(
            artifact_file_name(12, "Traffic Light", ArtifactFormat::Jpeg),
            "frame_12_traffic_light.jpg"
        );
        assert_eq!(artifact_file_name(3, "../car", ArtifactFormat::Png), "frame_3_car.png");
        assert_eq!(sanitize_label("???"), "object");
    }

    #[test]
    fn parse_rejects_traversal_and_foreign_files() {
        assert!(ArtifactName::parse("frame_1_car.jpg").is_some());
        for bad in [
            "",
            "../frame_1_car.jpg",
            "frame_1_car.jpg/..",
            "sub/frame_1_car.jpg",
            "..\\frame_1_car.jpg",
            ".frame_1_car.jpg.tmp",
            "frame_x_car.jpg",
            "frame_1_.jpg",
            "frame_1_car.exe",
            "detections.ndjson",
            "frame_1_Car.jpg",
        ] {
            assert!(ArtifactName::parse(bad).is_none(), "{bad} must be rejected");
        }
    }

    #[test]
    fn save_then_list_and_fetch() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path(), ArtifactFormat::Png).unwrap();
        let reader = store.reader();

        for id in [9u64, 10, 2] {
            store.save(id, "car", &tiny_image()).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();

        assert_eq!(
            reader.list_recent(20).unwrap(),
            vec!["frame_10_car.png", "frame_9_car.png", "frame_2_car.png"]
        );
        assert_eq!(reader.list_recent(1).unwrap(), vec!["frame_10_car.png"]);

        let bytes = reader.fetch("frame_9_car.png").unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 3));
        assert!(reader.fetch("frame_99_car.png").is_err());
        assert!(reader.fetch("../frame_9_car.png").is_err());
    }

    #[test]
    fn save_leaves_no_temporary_files() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path(), ArtifactFormat::Jpeg).unwrap();
        store.save(1, "truck", &tiny_image()).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["frame_1_truck.jpg"]);
        assert_eq!(content_type_for("frame_1_truck.jpg"), "image/jpeg");
    }
}
