//! Read-only access to a reference database laid out as
//! `<root>/<person_name>/<image>.jpg`.
//!
//! The tree is walked recursively. A file's person is the name of its parent
//! directory; files directly under the root are named after their file stem.
//! Hidden entries are ignored. Directory symlinks are not followed, so a
//! link back into the tree cannot repeat images; symlinked image files are
//! kept.

use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("reference database not found: {0}")]
    NotFound(String),
    #[error("reference database {0} contains no images")]
    Empty(String),
    #[error("could not read reference database: {0}")]
    Walk(#[from] walkdir::Error),
}

/// One reference image and the person it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub person: String,
    pub path: PathBuf,
}

/// A scanned snapshot of the reference directory.
#[derive(Debug, Clone)]
pub struct FaceDatabase {
    root: PathBuf,
    images: Vec<ReferenceImage>,
}

impl FaceDatabase {
    /// Scan `root` for reference images, sorted by path.
    ///
    /// A missing root or a tree without any image is an error.
    pub fn open(root: &Path) -> Result<Self, DatabaseError> {
        if !root.is_dir() {
            return Err(DatabaseError::NotFound(root.display().to_string()));
        }

        let mut images = Vec::new();
        let entries = WalkDir::new(root).min_depth(1).into_iter().filter_entry(|e| !is_hidden(e));
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_file = entry.file_type().is_file() || (entry.path_is_symlink() && path.is_file());
            if !is_file || !is_image(path) {
                continue;
            }
            if let Some(person) = person_name(root, path) {
                images.push(ReferenceImage { person, path: path.to_path_buf() });
            }
        }
        if images.is_empty() {
            return Err(DatabaseError::Empty(root.display().to_string()));
        }
        images.sort_by(|a, b| a.path.cmp(&b.path));

        tracing::debug!(root = %root.display(), images = images.len(), "scanned reference database");

        Ok(Self { root: root.to_path_buf(), images })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images(&self) -> &[ReferenceImage] {
        &self.images
    }

    /// Distinct person names, sorted.
    pub fn people(&self) -> Vec<&str> {
        let mut people: Vec<&str> = self.images.iter().map(|i| i.person.as_str()).collect();
        people.sort_unstable();
        people.dedup();
        people
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

fn person_name(root: &Path, path: &Path) -> Option<String> {
    let parent = path.parent()?;
    if parent == root {
        path.file_stem().map(|s| s.to_string_lossy().into_owned())
    } else {
        parent.file_name().map(|s| s.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, b"x").expect("write");
    }

    #[test]
    fn test_scan_people() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        touch(&root.join("alice/1.jpg"));
        touch(&root.join("alice/2.PNG"));
        touch(&root.join("bob/portrait.jpeg"));
        touch(&root.join("bob/notes.txt"));
        touch(&root.join("carol.webp"));
        touch(&root.join(".cache/hidden.jpg"));
        touch(&root.join("class/dave/a.jpg"));

        let db = FaceDatabase::open(root).expect("open");
        let found: Vec<(&str, String)> = db
            .images()
            .iter()
            .map(|i| (i.person.as_str(), i.path.strip_prefix(root).unwrap().display().to_string()))
            .collect();

        assert_eq!(
            found,
            vec![
                ("alice", "alice/1.jpg".to_string()),
                ("alice", "alice/2.PNG".to_string()),
                ("bob", "bob/portrait.jpeg".to_string()),
                ("carol", "carol.webp".to_string()),
                ("dave", "class/dave/a.jpg".to_string()),
            ]
        );
        assert_eq!(db.people(), vec!["alice", "bob", "carol", "dave"]);
    }

    #[test]
    fn test_missing_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = FaceDatabase::open(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[test]
    fn test_empty_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("alice/readme.md"));
        let err = FaceDatabase::open(dir.path()).unwrap_err();
        assert!(matches!(err, DatabaseError::Empty(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directories_are_not_followed() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        touch(&root.join("alice/1.jpg"));
        symlink(root, root.join("alice/loop")).expect("dir symlink");
        fs::create_dir_all(root.join("carol")).expect("mkdir");
        symlink(root.join("alice/1.jpg"), root.join("carol/me.jpg")).expect("file symlink");

        let db = FaceDatabase::open(root).expect("open");
        let found: Vec<(&str, &Path)> = db
            .images()
            .iter()
            .map(|i| (i.person.as_str(), i.path.strip_prefix(root).unwrap()))
            .collect();
        assert_eq!(found, vec![("alice", Path::new("alice/1.jpg")), ("carol", Path::new("carol/me.jpg"))]);
    }
}
