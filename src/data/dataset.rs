//! クラスごとのサブディレクトリからなるデータセット
//!
//! ```text
//! root/
//!   handstand/
//!     a.jpg
//!     session_2/b.avif
//!   not_handstand/
//!     c.png
//! ```
//!
//! ルート直下のディレクトリ名をソートした順がクラスIDになります。
//! 各クラス配下はシンボリックリンクをたどって再帰的に走査し、見つかった全ファイルをサンプルにします。
//! AVIFのサンプルを読むには `avif` フィーチャーが必要です。

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use burn::data::dataset::Dataset;
use image::RgbImage;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::image_loader::load_rgb_image;
use super::image_tensor::ImageTensor;
use super::transforms::Pipeline;
use crate::error::{Error, Result};

/// `get` が返す画像（パイプラインがあればテンソル、なければデコード画像のまま）
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetImage {
    Tensor(ImageTensor),
    Image(RgbImage),
}

/// Burnのデータローダー向けアイテム（パスのみ保持）
#[derive(Clone, Debug, PartialEq)]
pub struct HandstandItem {
    pub path: PathBuf,
    pub label: usize,
}

/// ディレクトリ構成から作る画像分類データセット
#[derive(Debug, Clone)]
pub struct HandstandDataset {
    root: PathBuf,
    transform: Option<Pipeline>,
    classes: Vec<String>,
    class_to_idx: HashMap<String, usize>,
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
}

impl HandstandDataset {
    /// ルートディレクトリを走査してデータセットを構築
    pub fn new<P: AsRef<Path>>(root: P, transform: Option<Pipeline>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            return Err(Error::MissingFile { path: root });
        }

        let classes = list_class_dirs(&root)?;
        let class_to_idx: HashMap<String, usize> = classes
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut samples = Vec::new();
        for (class_index, class_name) in classes.iter().enumerate() {
            let files = walk_files(&root.join(class_name))?;
            debug!("クラス {} ({}): {} 枚", class_index, class_name, files.len());
            samples.extend(files.into_iter().map(|path| (path, class_index)));
        }

        info!(
            "データセットを読み込みました: {} ({} クラス, {} サンプル)",
            root.display(),
            classes.len(),
            samples.len()
        );

        Ok(Self {
            root,
            transform,
            classes,
            class_to_idx,
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn transform(&self) -> Option<Pipeline> {
        self.transform
    }

    /// ソート済みクラス名
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn class_to_idx(&self, class_name: &str) -> Option<usize> {
        self.class_to_idx.get(class_name).copied()
    }

    pub fn samples(&self) -> &[(PathBuf, usize)] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// index番目の画像を読み込み、変換して (画像, クラスID) を返す
    pub fn get(&self, index: usize) -> Result<(DatasetImage, usize)> {
        let (path, target) = self.samples.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.samples.len(),
        })?;

        let img = load_rgb_image(path)?;
        let image = match self.transform {
            Some(pipeline) => DatasetImage::Tensor(pipeline.apply(&img)?),
            None => DatasetImage::Image(img),
        };
        Ok((image, *target))
    }
}

impl Dataset<HandstandItem> for HandstandDataset {
    fn get(&self, index: usize) -> Option<HandstandItem> {
        let (path, label) = self.samples.get(index)?;
        Some(HandstandItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// ルート直下のディレクトリ名（リンク先がディレクトリのものを含む）をソートして返す
fn list_class_dirs(root: &Path) -> Result<Vec<String>> {
    let mut classes = Vec::new();
    for entry in std::fs::read_dir(root).map_err(|e| Error::io(root, e))? {
        let entry = entry.map_err(|e| Error::io(root, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            classes.push(name.to_string());
        }
    }
    classes.sort();
    Ok(classes)
}

/// ディレクトリ配下の全ファイルを決定的な順序で集める
///
/// ディレクトリはフルパスの辞書順、各ディレクトリ内はファイル名順。
/// リンク切れはファイルとして数え、それ以外の走査エラーは返す。
fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let err = match entry {
            Ok(entry) if entry.file_type().is_dir() => continue,
            Ok(entry) => {
                push_file(&mut files, entry.into_path());
                continue;
            }
            Err(err) => err,
        };

        if let Some(ancestor) = err.loop_ancestor() {
            debug!("リンクの循環をスキップします: {}", ancestor.display());
            continue;
        }
        let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
        let not_found = err.io_error().is_some_and(|e| e.kind() == io::ErrorKind::NotFound);
        if not_found && path.is_symlink() {
            push_file(&mut files, path);
            continue;
        }
        let source = err
            .into_io_error()
            .unwrap_or_else(|| io::Error::other("directory walk failed"));
        return Err(Error::io(path, source));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.file_name().cmp(&b.1.file_name())));
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

fn push_file(files: &mut Vec<(String, PathBuf)>, path: PathBuf) {
    let parent = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    files.push((parent, path));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_walk_order_matches_sorted_directory_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let class_dir = tmp.path().join("cls");
        touch(&class_dir.join("b.png"));
        touch(&class_dir.join("a.png"));
        touch(&class_dir.join("sub/z.png"));
        touch(&class_dir.join("sub-x/y.png"));
        touch(&class_dir.join("sub/deep/w.png"));

        let files = walk_files(&class_dir).unwrap();
        let rel: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(&class_dir).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();

        // ".../sub" < ".../sub-x" < ".../sub/deep" （'-' < '/'）
        assert_eq!(
            rel,
            vec!["a.png", "b.png", "sub/z.png", "sub-x/y.png", "sub/deep/w.png"]
        );
    }

    #[test]
    fn test_loose_files_in_root_are_not_classes() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("README.txt"));
        touch(&tmp.path().join("handstand/1.png"));

        let ds = HandstandDataset::new(tmp.path(), None).unwrap();
        assert_eq!(ds.classes(), ["handstand".to_string()]);
        assert_eq!(ds.len(), 1);
    }

    #[test]
    fn test_index_out_of_range() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("a/1.png"));
        let ds = HandstandDataset::new(tmp.path(), None).unwrap();

        let err = ds.get(5).unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange { index: 5, len: 1 }));
    }

    #[test]
    fn test_burn_dataset_view() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("b/2.png"));
        touch(&tmp.path().join("a/1.png"));
        let ds = HandstandDataset::new(tmp.path(), None).unwrap();

        let item = Dataset::get(&ds, 1).unwrap();
        assert_eq!(item.label, 1);
        assert!(item.path.ends_with("b/2.png"));
        assert!(Dataset::get(&ds, 2).is_none());
        assert_eq!(Dataset::len(&ds), 2);
    }

    #[test]
    fn test_missing_root() {
        let err = HandstandDataset::new("does/not/exist", None).unwrap_err();
        assert!(err.is_missing_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_follows_symlinks_without_looping() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tmp.path().join("outside");
        touch(&outside.join("linked.png"));

        let root = tmp.path().join("root");
        touch(&root.join("cls/own.png"));
        std::os::unix::fs::symlink(&outside, root.join("cls/extra")).unwrap();
        // 自分自身へのリンク
        std::os::unix::fs::symlink(root.join("cls"), root.join("cls/self")).unwrap();

        let ds = HandstandDataset::new(&root, None).unwrap();
        let names: Vec<String> = ds
            .samples()
            .iter()
            .map(|(p, _)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["own.png", "linked.png"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_broken_link_is_listed_as_file() {
        let tmp = tempfile::tempdir().unwrap();
        let class_dir = tmp.path().join("cls");
        touch(&class_dir.join("a.png"));
        std::os::unix::fs::symlink(tmp.path().join("gone.png"), class_dir.join("b.png")).unwrap();

        let ds = HandstandDataset::new(tmp.path(), None).unwrap();
        assert_eq!(ds.len(), 2);
        assert!(ds.samples()[1].0.ends_with("cls/b.png"));
        assert!(ds.get(1).unwrap_err().is_missing_file());
    }
}
