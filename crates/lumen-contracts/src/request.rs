use serde::{Deserialize, Serialize};

use crate::dedup::fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    GenerateImage,
    EditImage,
    TextToVideo,
    ImageToVideo,
    FuseImages,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerateImage => "generate_image",
            Self::EditImage => "edit_image",
            Self::TextToVideo => "text_to_video",
            Self::ImageToVideo => "image_to_video",
            Self::FuseImages => "fuse_images",
        }
    }

    /// Noun phrase used in user-facing messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::GenerateImage => "image generation",
            Self::EditImage => "image edit",
            Self::TextToVideo => "video generation",
            Self::ImageToVideo => "image animation",
            Self::FuseImages => "image fusion",
        }
    }

    /// Operations that transform media already in the thread.
    pub fn is_edit_class(&self) -> bool {
        matches!(
            self,
            Self::EditImage | Self::ImageToVideo | Self::FuseImages
        )
    }

    pub fn produces_video(&self) -> bool {
        matches!(self, Self::TextToVideo | Self::ImageToVideo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSettings {
    pub resolution: String,
    pub aspect_ratio: String,
    pub num_frames: u32,
    pub frames_per_second: u32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            resolution: "720p".to_string(),
            aspect_ratio: "16:9".to_string(),
            num_frames: 81,
            frames_per_second: 16,
        }
    }
}

/// One normalized unit of work. Never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub thread_id: String,
    pub kind: OperationKind,
    pub prompt: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default = "default_count")]
    pub count: u32,
    pub video: Option<VideoSettings>,
}

impl GenerationRequest {
    pub fn new(thread_id: &str, kind: OperationKind, prompt: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            kind,
            prompt: prompt.to_string(),
            targets: Vec::new(),
            count: default_count(),
            video: kind.produces_video().then(VideoSettings::default),
        }
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count.max(1);
        self
    }

    pub fn with_video(mut self, video: VideoSettings) -> Self {
        self.video = Some(video);
        self
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.prompt)
    }

    /// Stable identity of the target set, independent of selection order.
    pub fn target_key(&self) -> String {
        let mut targets = self.targets.clone();
        targets.sort();
        targets.join(",")
    }
}

fn default_count() -> u32 {
    1
}
