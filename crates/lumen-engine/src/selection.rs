use std::path::Path;
use std::time::{Duration, SystemTime};

use lumen_contracts::context::ThreadContext;
use tracing::debug;

use crate::storage::{embedded_timestamp, StorageLayout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionReason {
    Label(String),
    Recent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedImage {
    pub reference: String,
    pub reason: SelectionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionError {
    NoTarget,
    InsufficientImages { found: usize },
}

/// Picks the image an edit or animation should operate on.
///
/// A subject label named in the instruction wins; otherwise the most recent
/// artifact is used. Candidates that no longer exist are skipped.
pub fn select_target(
    context: Option<&ThreadContext>,
    instruction: &str,
    layout: &StorageLayout,
) -> Result<SelectedImage, SelectionError> {
    let Some(context) = context else {
        return Err(SelectionError::NoTarget);
    };
    let lowered = instruction.to_lowercase();

    // Newest first, so a label shared by two images resolves to the later one.
    for (path, label) in context.image_labels.iter().rev() {
        if label.is_empty() || !lowered.contains(label.as_str()) {
            continue;
        }
        if is_accessible(path, layout) {
            debug!(thread_id = %context.thread_id, label = %label, path = %path, "selected image by label");
            return Ok(SelectedImage {
                reference: path.clone(),
                reason: SelectionReason::Label(label.clone()),
            });
        }
    }

    match context.recent_path.as_deref() {
        Some(recent) if is_accessible(recent, layout) => Ok(SelectedImage {
            reference: recent.to_string(),
            reason: SelectionReason::Recent,
        }),
        _ => Err(SelectionError::NoTarget),
    }
}

/// Source images for a fusion: up to `max_images` of the newest history
/// entries that follow the artifact convention and were created within
/// `recency` of `now`. Names without an embedded timestamp count as recent.
/// At least two are required.
pub fn select_fusion_sources(
    context: Option<&ThreadContext>,
    layout: &StorageLayout,
    now: SystemTime,
    max_images: usize,
    recency: Duration,
) -> Result<Vec<String>, SelectionError> {
    let Some(context) = context else {
        return Err(SelectionError::InsufficientImages { found: 0 });
    };
    let skip = context.uploaded_images.len().saturating_sub(max_images);
    let sources: Vec<String> = context
        .uploaded_images
        .iter()
        .skip(skip)
        .filter(|reference| {
            layout
                .canonicalize_reference(reference)
                .map(|path| path.is_file())
                .unwrap_or(false)
        })
        .filter(|reference| is_recent(reference, now, recency))
        .cloned()
        .collect();

    if sources.len() < 2 {
        return Err(SelectionError::InsufficientImages {
            found: sources.len(),
        });
    }
    Ok(sources)
}

fn is_recent(reference: &str, now: SystemTime, recency: Duration) -> bool {
    match embedded_timestamp(reference) {
        Some(created) => match now.duration_since(created) {
            Ok(age) => age <= recency,
            Err(_) => true,
        },
        None => true,
    }
}

/// Remote URLs are trusted to be reachable; local references must exist.
pub(crate) fn is_accessible(reference: &str, layout: &StorageLayout) -> bool {
    if let Some(path) = layout.canonicalize_reference(reference) {
        return path.is_file();
    }
    if is_remote(reference) {
        return true;
    }
    Path::new(reference).is_file()
}

pub(crate) fn is_remote(reference: &str) -> bool {
    let lowered = reference.trim().to_ascii_lowercase();
    lowered.starts_with("http://") || lowered.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use lumen_contracts::context::ThreadContext;

    use super::{select_fusion_sources, select_target, SelectionError, SelectionReason};
    use crate::storage::{MediaKind, StorageLayout};

    fn layout(root: &Path) -> StorageLayout {
        StorageLayout::new(root, "assets", "videos", "/static")
    }

    fn write(layout: &StorageLayout, prefix: &str, at: SystemTime) -> anyhow::Result<PathBuf> {
        layout.write_new(MediaKind::Image, prefix, "png", b"png", at)
    }

    fn context_with(entries: &[(&Path, Option<&str>)]) -> ThreadContext {
        let mut context = ThreadContext::new("t1");
        for (path, label) in entries {
            let path = path.to_string_lossy().to_string();
            context.uploaded_images.push_back(path.clone());
            if let Some(label) = label {
                context.image_labels.insert(path.clone(), label.to_string());
            }
            context.recent_path = Some(path);
        }
        context
    }

    #[test]
    fn label_in_instruction_beats_recent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = layout(temp.path());
        let now = SystemTime::now();
        let cat = write(&layout, "upload", now)?;
        let dog = write(&layout, "upload", now)?;
        let context = context_with(&[(&cat, Some("cat")), (&dog, Some("dog"))]);

        let picked = select_target(Some(&context), "Make the CAT wear a hat", &layout);
        assert_eq!(
            picked,
            Ok(super::SelectedImage {
                reference: cat.to_string_lossy().to_string(),
                reason: SelectionReason::Label("cat".to_string()),
            })
        );

        let picked = select_target(Some(&context), "make it brighter", &layout);
        assert_eq!(
            picked.map(|image| (image.reference, image.reason)),
            Ok((dog.to_string_lossy().to_string(), SelectionReason::Recent))
        );
        Ok(())
    }

    #[test]
    fn missing_files_are_skipped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = layout(temp.path());
        let cat = write(&layout, "upload", SystemTime::now())?;
        let gone = layout.assets_dir().join("upload_1.png");
        let context = context_with(&[(&cat, Some("cat")), (&gone, Some("dog"))]);

        let picked = select_target(Some(&context), "make the dog run", &layout);
        assert_eq!(picked, Err(SelectionError::NoTarget));

        fs::remove_file(&cat)?;
        let picked = select_target(Some(&context), "make the cat run", &layout);
        assert_eq!(picked, Err(SelectionError::NoTarget));
        Ok(())
    }

    #[test]
    fn no_context_means_no_target() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = layout(temp.path());
        assert_eq!(
            select_target(None, "edit", &layout),
            Err(SelectionError::NoTarget)
        );
        Ok(())
    }

    #[test]
    fn fusion_needs_two_recent_conventional_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = layout(temp.path());
        let now = UNIX_EPOCH + Duration::from_secs(1_718_000_000);
        let stale = write(&layout, "upload", now - Duration::from_secs(601))?;
        let fresh = write(&layout, "generated", now - Duration::from_secs(30))?;
        let outside = temp.path().join("loose.png");
        fs::write(&outside, b"png")?;

        let context = context_with(&[(&stale, None), (&outside, None), (&fresh, None)]);
        let result =
            select_fusion_sources(Some(&context), &layout, now, 5, Duration::from_secs(600));
        assert_eq!(result, Err(SelectionError::InsufficientImages { found: 1 }));

        let second = write(&layout, "edited", now - Duration::from_secs(5))?;
        let context = context_with(&[(&stale, None), (&fresh, None), (&second, None)]);
        let result =
            select_fusion_sources(Some(&context), &layout, now, 5, Duration::from_secs(600));
        assert_eq!(
            result,
            Ok(vec![
                fresh.to_string_lossy().to_string(),
                second.to_string_lossy().to_string(),
            ])
        );
        Ok(())
    }

    #[test]
    fn undated_artifacts_count_as_recent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = layout(temp.path());
        let first = layout.assets_dir().join("cat.png");
        let second = layout.assets_dir().join("dog.png");
        fs::create_dir_all(layout.assets_dir())?;
        fs::write(&first, b"png")?;
        fs::write(&second, b"png")?;
        let context = context_with(&[(&first, None), (&second, None)]);

        let now = UNIX_EPOCH + Duration::from_secs(4_000_000_000);
        let result =
            select_fusion_sources(Some(&context), &layout, now, 5, Duration::from_secs(600));
        assert_eq!(result.map(|sources| sources.len()), Ok(2));
        Ok(())
    }

    #[test]
    fn fusion_only_considers_the_newest_entries() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = layout(temp.path());
        let now = SystemTime::now();
        let mut paths = Vec::new();
        for _ in 0..4 {
            paths.push(write(&layout, "upload", now)?);
        }
        let entries: Vec<(&Path, Option<&str>)> =
            paths.iter().map(|path| (path.as_path(), None)).collect();
        let context = context_with(&entries);

        let result =
            select_fusion_sources(Some(&context), &layout, now, 3, Duration::from_secs(600))
                .unwrap_or_default();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0], paths[1].to_string_lossy());
        Ok(())
    }
}
