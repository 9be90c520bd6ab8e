use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use regex::Regex;

const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// Where conversation artifacts live on disk and how they are addressed by
/// the web tier.
///
/// Images are served as `{route}/{assets}/<file>` and videos as
/// `{route}/{videos}/<file>`. Only single-segment file names are ever
/// resolved, so a reference can never escape the storage root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    assets: String,
    videos: String,
    route: String,
}

impl StorageLayout {
    pub fn new(root: &Path, assets: &str, videos: &str, route: &str) -> Self {
        let route = route.trim().trim_end_matches('/');
        Self {
            root: root.to_path_buf(),
            assets: assets.trim_matches('/').to_string(),
            videos: videos.trim_matches('/').to_string(),
            route: if route.starts_with('/') {
                route.to_string()
            } else {
                format!("/{route}")
            },
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.root.join(&self.assets)
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.root.join(&self.videos)
    }

    pub fn dir_for(&self, kind: MediaKind) -> PathBuf {
        match kind {
            MediaKind::Image => self.assets_dir(),
            MediaKind::Video => self.videos_dir(),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.assets_dir(), self.videos_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Writes `bytes` to a fresh `{prefix}_{micros}.{ext}` file. Names that
    /// already exist get a `_{n}` suffix; existing files are never replaced.
    pub fn write_new(
        &self,
        kind: MediaKind,
        prefix: &str,
        ext: &str,
        bytes: &[u8],
        now: SystemTime,
    ) -> Result<PathBuf> {
        let dir = self.dir_for(kind);
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let stamp = now
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_micros())
            .unwrap_or(0);
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{prefix}_{stamp}.{ext}")
            } else {
                format!("{prefix}_{stamp}_{attempt}.{ext}")
            };
            let path = dir.join(name);
            let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to create {}", path.display()))
                }
            };
            fill_or_remove(&path, file, bytes)?;
            return Ok(path);
        }
        bail!(
            "could not find a free file name for {prefix}_{stamp}.{ext} in {}",
            dir.display()
        )
    }

    /// Web route for an artifact stored under this layout.
    pub fn display_url(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let parent = path.parent()?;
        if parent == self.assets_dir() {
            Some(format!("{}/{}/{}", self.route, self.assets, name))
        } else if parent == self.videos_dir() {
            Some(format!("{}/{}/{}", self.route, self.videos, name))
        } else {
            None
        }
    }

    /// Display URL when the path is ours, the raw path otherwise.
    pub fn display_ref(&self, path: &Path) -> String {
        self.display_url(path)
            .unwrap_or_else(|| path.to_string_lossy().to_string())
    }

    /// Maps a static-route URL (optionally with scheme and host) back to the
    /// file it serves.
    pub fn resolve_route(&self, url: &str) -> Option<PathBuf> {
        let trimmed = url.trim();
        let path_part = match trimmed.find("://") {
            Some(idx) => {
                let after_scheme = &trimmed[idx + 3..];
                &after_scheme[after_scheme.find('/')?..]
            }
            None => trimmed,
        };
        let path_part = path_part
            .split(['?', '#'])
            .next()
            .unwrap_or(path_part);
        let tail = path_part.strip_prefix(self.route.as_str())?.strip_prefix('/')?;
        self.resolve_relative(tail)
    }

    /// Canonical on-disk path for any reference that follows the artifact
    /// naming convention: an absolute path inside the storage directories, a
    /// static-route URL, or a relative `assets/<file>` path.
    pub fn canonicalize_reference(&self, reference: &str) -> Option<PathBuf> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(path) = self.resolve_route(trimmed) {
            return Some(path);
        }
        if trimmed.contains("://") {
            return None;
        }
        let as_path = Path::new(trimmed);
        if as_path.is_absolute() {
            let name = safe_file_name(as_path.file_name()?.to_str()?)?;
            let parent = as_path.parent()?;
            if parent == self.assets_dir() || parent == self.videos_dir() {
                return Some(parent.join(name));
            }
            return None;
        }
        self.resolve_relative(trimmed.trim_start_matches("./"))
    }

    pub fn is_conversation_artifact(&self, reference: &str) -> bool {
        self.canonicalize_reference(reference).is_some()
    }

    fn resolve_relative(&self, tail: &str) -> Option<PathBuf> {
        let (dir, name) = tail.split_once('/')?;
        let name = safe_file_name(name)?;
        if dir == self.assets {
            Some(self.assets_dir().join(name))
        } else if dir == self.videos {
            Some(self.videos_dir().join(name))
        } else {
            None
        }
    }
}

fn safe_file_name(name: &str) -> Option<&str> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
    {
        return None;
    }
    Some(name)
}

/// Creation time encoded in an artifact name such as `edited_1718000000123456.png`.
/// Ten digits are read as seconds, thirteen as milliseconds and sixteen as
/// microseconds.
pub fn embedded_timestamp(reference: &str) -> Option<SystemTime> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"_(\d{10,16})(?:_\d+)?\.[A-Za-z0-9]+$").ok())
        .as_ref()?;
    let name = reference.rsplit(['/', '\\']).next().unwrap_or(reference);
    let digits = pattern.captures(name)?.get(1)?.as_str();
    let value: u64 = digits.parse().ok()?;
    let offset = match digits.len() {
        10 => Duration::from_secs(value),
        13 => Duration::from_millis(value),
        16 => Duration::from_micros(value),
        _ => return None,
    };
    UNIX_EPOCH.checked_add(offset)
}

/// Chat markup for a stored artifact.
pub fn markup(kind: MediaKind, url: &str, alt: &str) -> String {
    match kind {
        MediaKind::Image => format!("![{alt}]({url})"),
        MediaKind::Video => format!("<video controls src=\"{url}\"></video>"),
    }
}

pub fn media_kind_for_path(path: &Path) -> Option<MediaKind> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())?;
    match ext.as_str() {
        "png" | "jpg" | "jpeg" | "webp" | "gif" => Some(MediaKind::Image),
        "mp4" | "webm" | "mov" => Some(MediaKind::Video),
        _ => None,
    }
}

// A half-written artifact must not stay behind for the recovery scanner.
fn fill_or_remove(path: &Path, mut out: impl Write, bytes: &[u8]) -> Result<()> {
    if let Err(err) = out.write_all(bytes).and_then(|()| out.flush()) {
        drop(out);
        let _ = fs::remove_file(path);
        return Err(err).with_context(|| format!("failed to write {}", path.display()));
    }
    Ok(())
}
