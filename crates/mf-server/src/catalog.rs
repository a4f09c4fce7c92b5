//! Video catalog.
//!
//! Records live in memory. [`DiskVideoCatalog`] rebuilds them on startup by
//! scanning `{streams_dir}/{video_id}/{preset}.mp4` for the configured
//! presets; a directory with at least one of them is a video, and its
//! metadata comes from probing the smallest rendition.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use mf_av::MetadataProber;
use mf_core::{order_presets, Preset, RenditionOutput, VideoId, VideoRecord};

#[async_trait]
pub trait VideoCatalog: Send + Sync {
    /// Replace the in-memory state with what is on disk. Returns the number
    /// of videos found.
    async fn rebuild(&self) -> mf_core::Result<usize>;

    fn register(&self, record: VideoRecord);

    fn get(&self, video_id: VideoId) -> Option<VideoRecord>;

    fn list(&self) -> Vec<VideoRecord>;

    fn remove(&self, video_id: VideoId) -> Option<VideoRecord>;
}

pub struct DiskVideoCatalog {
    streams_dir: PathBuf,
    /// Ascending, so renditions come out in ladder order.
    presets: Vec<Preset>,
    prober: Arc<dyn MetadataProber>,
    videos: RwLock<HashMap<VideoId, VideoRecord>>,
}

impl DiskVideoCatalog {
    pub fn new(streams_dir: PathBuf, mut presets: Vec<Preset>, prober: Arc<dyn MetadataProber>) -> Self {
        order_presets(&mut presets);
        Self {
            streams_dir,
            presets,
            prober,
            videos: RwLock::new(HashMap::new()),
        }
    }

    /// Build a record from one `{video_id}` directory, if it holds any
    /// rendition of a configured preset.
    async fn scan_video_dir(&self, video_id: VideoId, dir: &Path) -> Option<VideoRecord> {
        let mut renditions = Vec::new();

        for preset in &self.presets {
            let path = dir.join(preset.file_name());
            let Ok(meta) = tokio::fs::metadata(&path).await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            renditions.push(RenditionOutput {
                preset: preset.name.clone(),
                path,
                width: preset.width,
                height: preset.height,
                size_bytes: meta.len(),
            });
        }

        let first = renditions.first()?;
        let metadata = match self.prober.probe(&first.path).await {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                tracing::warn!(
                    video_id = %video_id,
                    path = %first.path.display(),
                    error = %e,
                    "Could not probe restored rendition"
                );
                None
            }
        };

        Some(VideoRecord {
            video_id,
            name: video_id.to_string(),
            metadata,
            renditions,
        })
    }
}

#[async_trait]
impl VideoCatalog for DiskVideoCatalog {
    async fn rebuild(&self) -> mf_core::Result<usize> {
        let mut found = HashMap::new();

        match tokio::fs::read_dir(&self.streams_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    let Some(video_id) = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .and_then(|n| n.parse::<VideoId>().ok())
                    else {
                        continue;
                    };
                    if let Some(record) = self.scan_video_dir(video_id, &path).await {
                        found.insert(video_id, record);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let count = found.len();
        *self.videos.write() = found;
        tracing::info!(videos = count, dir = %self.streams_dir.display(), "Video catalog rebuilt");
        Ok(count)
    }

    fn register(&self, record: VideoRecord) {
        tracing::debug!(video_id = %record.video_id, renditions = record.renditions.len(), "Video registered");
        self.videos.write().insert(record.video_id, record);
    }

    fn get(&self, video_id: VideoId) -> Option<VideoRecord> {
        self.videos.read().get(&video_id).cloned()
    }

    fn list(&self) -> Vec<VideoRecord> {
        let mut videos: Vec<_> = self.videos.read().values().cloned().collect();
        videos.sort_by(|a, b| a.name.cmp(&b.name));
        videos
    }

    fn remove(&self, video_id: VideoId) -> Option<VideoRecord> {
        self.videos.write().remove(&video_id)
    }
}
