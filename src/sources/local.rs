//! Local folder source: year-named top-level directories are albums, every
//! image file below them (recursively) is an asset.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::SourceError;
use crate::model::{Asset, MediaType};
use crate::sources::{buckets_by_year, is_excluded, AssetSource, BucketRef, GroupRef};

const SNIFF_LEN: u64 = 64;

pub struct LocalFolderSource {
    root: PathBuf,
    exclusions: Vec<String>,
}

impl LocalFolderSource {
    pub fn new(root: impl Into<PathBuf>, exclusions: Vec<String>) -> Self {
        Self {
            root: root.into(),
            exclusions,
        }
    }
}

/// Sniffs the file header; `None` for anything not on the cast allow-list.
pub fn sniff_media_type(path: &Path) -> Option<MediaType> {
    let mut header = Vec::with_capacity(SNIFF_LEN as usize);
    let file = File::open(path).ok()?;
    file.take(SNIFF_LEN).read_to_end(&mut header).ok()?;
    let format = image::guess_format(&header).ok()?;
    MediaType::from_image_format(format)
}

/// Root-relative path with `/` separators, used as the asset id.
fn relative_id(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect();
    Some(parts?.join("/"))
}

fn collect_image_files(root: &Path, folder_path: &Path, exclusions: &[String]) -> Vec<Asset> {
    let mut pending_directories = vec![folder_path.to_path_buf()];
    let mut assets = Vec::new();

    while let Some(directory) = pending_directories.pop() {
        let entries = match std::fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("Failed to read directory {}: {}", directory.display(), err);
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(
                        "Failed to read a directory entry in {}: {}",
                        directory.display(),
                        err
                    );
                    continue;
                }
            };

            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if is_excluded(&name, exclusions) {
                debug!("Ignoring excluded path {}", path.display());
                continue;
            }
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    debug!("Failed to inspect {}: {}", path.display(), err);
                    continue;
                }
            };

            if file_type.is_dir() {
                pending_directories.push(path);
                continue;
            }

            if !file_type.is_file() {
                continue;
            }
            let Some(media_type) = sniff_media_type(&path) else {
                debug!("Ignoring unsupported file {}", path.display());
                continue;
            };
            if let Some(id) = relative_id(root, &path) {
                assets.push(Asset::new(id, media_type));
            }
        }
    }

    assets.sort_unstable_by(|a, b| a.id.cmp(&b.id));
    assets
}

impl AssetSource for LocalFolderSource {
    fn list_buckets(&self) -> Result<Vec<BucketRef>, SourceError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| SourceError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut groups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SourceError::Io {
                path: self.root.clone(),
                source,
            })?;
            let is_dir = entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(ToOwned::to_owned) else {
                debug!("Ignoring non UTF-8 directory {}", entry.path().display());
                continue;
            };
            groups.push(GroupRef {
                id: name.clone(),
                name,
            });
        }
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets_by_year(groups, true))
    }

    fn list_assets(&self, group: &GroupRef) -> Result<Vec<Asset>, SourceError> {
        let folder = self.root.join(&group.id);
        if !folder.is_dir() {
            return Err(SourceError::Io {
                path: folder,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "album folder vanished"),
            });
        }
        Ok(collect_image_files(&self.root, &folder, &self.exclusions))
    }

    fn describe(&self) -> String {
        format!("local folder {}", self.root.display())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;

    use super::{sniff_media_type, LocalFolderSource};
    use crate::model::{Asset, MediaType};
    use crate::sources::{AssetSource, GroupRef};

    pub(crate) const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";
    pub(crate) const JPEG_HEADER: &[u8] = b"\xff\xd8\xff\xe0\0\x10JFIF\0";

    pub(crate) fn write_file(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dirs should be created");
        }
        std::fs::write(path, bytes).expect("fixture should be written");
    }

    #[test]
    fn test_sniffing_uses_content_not_extension() {
        let dir = tempfile::tempdir().expect("temp dir");
        let disguised = dir.path().join("photo.txt");
        write_file(&disguised, PNG_HEADER);
        let text = dir.path().join("notes.jpg");
        write_file(&text, b"just some text, not a photo");

        assert_eq!(sniff_media_type(&disguised), Some(MediaType::Png));
        assert_eq!(sniff_media_type(&text), None);
    }

    #[test]
    fn test_buckets_from_year_named_directories() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(dir.path().join("[2021] Ski")).expect("dir");
        std::fs::create_dir_all(dir.path().join("2019 Rome")).expect("dir");
        std::fs::create_dir_all(dir.path().join("Misc")).expect("dir");
        write_file(&dir.path().join("[2018] loose.jpg"), JPEG_HEADER);

        let source = LocalFolderSource::new(dir.path(), Vec::new());
        let buckets = source.list_buckets().expect("listing should succeed");

        let years: Vec<i32> = buckets.iter().map(|bucket| bucket.year).collect();
        assert_eq!(years, vec![2019, 2021]);
        assert_eq!(buckets[0].groups[0].id, "2019 Rome");
    }

    #[test]
    fn test_assets_are_recursive_filtered_and_relative() {
        let dir = tempfile::tempdir().expect("temp dir");
        let album = dir.path().join("[2020] Trip");
        write_file(&album.join("a.jpg"), JPEG_HEADER);
        write_file(&album.join("day2/b.png"), PNG_HEADER);
        write_file(&album.join("day2/readme.txt"), b"hello");
        write_file(&album.join("Private/c.png"), PNG_HEADER);
        write_file(&album.join("d-private.jpg"), JPEG_HEADER);

        let source = LocalFolderSource::new(dir.path(), vec!["PRIVATE".to_string()]);
        let assets = source
            .list_assets(&GroupRef {
                id: "[2020] Trip".to_string(),
                name: "[2020] Trip".to_string(),
            })
            .expect("listing should succeed");

        assert_eq!(
            assets,
            vec![
                Asset::new("[2020] Trip/a.jpg", MediaType::Jpeg),
                Asset::new("[2020] Trip/day2/b.png", MediaType::Png),
            ]
        );
    }

    #[test]
    fn test_missing_root_is_an_io_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let source = LocalFolderSource::new(dir.path().join("missing"), Vec::new());
        assert!(source.list_buckets().is_err());
    }
}
