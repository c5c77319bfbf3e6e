//! Frame sources feeding the live stream loop.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use vigil_core::ImageBuffer;

/// Produces frames for one stream. `None` means no frame is available right
/// now; the loop asks again on the next tick.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Option<ImageBuffer>;
}

/// Replays a fixed list of frames once.
#[derive(Debug, Default)]
pub struct VecSource {
    frames: VecDeque<ImageBuffer>,
}

impl VecSource {
    pub fn new(frames: impl IntoIterator<Item = ImageBuffer>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for VecSource {
    fn next_frame(&mut self) -> Option<ImageBuffer> {
        self.frames.pop_front()
    }
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "webp"];

/// Cycles through the image files in a directory in name order.
///
/// Files that fail to decode are skipped with a warning.
pub struct DirectorySource {
    files: Vec<PathBuf>,
    next: usize,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();
        tracing::info!(dir = %dir.display(), frames = files.len(), "frame directory opened");
        Ok(Self { files, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Option<ImageBuffer> {
        // At most one pass per call so a directory of bad files cannot spin.
        for _ in 0..self.files.len() {
            let path = &self.files[self.next];
            self.next = (self.next + 1) % self.files.len();

            let decoded = std::fs::read(path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| ImageBuffer::from_encoded(&bytes).map_err(|e| e.to_string()));
            match decoded {
                Ok(frame) => return Some(frame),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable frame"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_source_drains_in_order() {
        let mut source = VecSource::new([
            ImageBuffer::gray(1, 1, vec![1]),
            ImageBuffer::gray(1, 1, vec![2]),
        ]);
        assert_eq!(source.next_frame().unwrap().data, vec![1]);
        assert_eq!(source.next_frame().unwrap().data, vec![2]);
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn test_directory_source_cycles_and_skips_bad_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        image::GrayImage::from_pixel(3, 2, image::Luma([10]))
            .save(dir.join("a.png"))
            .unwrap();
        std::fs::write(dir.join("b.png"), b"not an image").unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let mut source = DirectorySource::open(dir).unwrap();
        assert_eq!(source.len(), 2);
        for _ in 0..3 {
            let frame = source.next_frame().unwrap();
            assert_eq!((frame.width, frame.height), (3, 2));
        }
    }

    #[test]
    fn test_empty_directory_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = DirectorySource::open(dir.path()).unwrap();
        assert!(source.is_empty());
        assert!(source.next_frame().is_none());
    }
}
