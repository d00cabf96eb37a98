//! Cut planned crops out of source images and save them for the next stage.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use likeness_core::{CropPlan, CropRect};

use crate::curate::CurationReport;

const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub written: usize,
    pub skipped: usize,
}

/// Output file name: `<mode>_<stem>.jpg`, or `<stem>.jpg` for a fallback crop.
pub fn crop_file_name(stem: &str, plan: &CropPlan) -> String {
    match plan.mode() {
        Some(mode) => format!("{mode}_{stem}.jpg"),
        None => format!("{stem}.jpg"),
    }
}

/// Output stem per image id: the file stem, or the whole id flattened
/// (`x/a.jpg` -> `x_a_jpg`) when several ids share a file stem.
pub fn output_stems<'a, I>(ids: I) -> HashMap<&'a str, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let ids: Vec<&str> = ids.into_iter().collect();
    let stem_of = |id: &str| {
        Path::new(id)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string())
    };

    let mut counts: HashMap<String, usize> = HashMap::new();
    for id in &ids {
        *counts.entry(stem_of(id)).or_default() += 1;
    }

    ids.into_iter()
        .map(|id| {
            let stem = stem_of(id);
            let name = if counts[&stem] > 1 {
                id.chars()
                    .map(|c| if matches!(c, '/' | '\\' | '.') { '_' } else { c })
                    .collect()
            } else {
                stem
            };
            (id, name)
        })
        .collect()
}

/// Resolve a manifest id under `images_dir`. Ids that are absolute or walk
/// out of the directory resolve to `None`.
pub fn source_path(images_dir: &Path, id: &str) -> Option<PathBuf> {
    let rel = Path::new(id);
    let contained = rel
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if id.is_empty() || !contained {
        return None;
    }
    Some(images_dir.join(rel))
}

/// Write every crop of every kept image from `images_dir` into `out_dir`.
///
/// An image that cannot be read, whose size no longer matches the manifest,
/// or whose id points outside `images_dir` is skipped with a warning; write
/// failures and output name clashes abort.
pub fn export_crops(report: &CurationReport, images_dir: &Path, out_dir: &Path) -> Result<ExportStats> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating output directory {}", out_dir.display()))?;

    let stems = output_stems(report.kept().map(|entry| entry.id.as_str()));
    let mut written_names = HashSet::new();

    let total = report.summary.kept;
    let mut stats = ExportStats::default();
    for (i, entry) in report.kept().enumerate() {
        if i % 25 == 0 {
            tracing::info!(done = i, total, "exporting crops");
        }

        let Some(src) = source_path(images_dir, &entry.id) else {
            tracing::warn!(id = %entry.id, "image id escapes the images directory; skipping");
            stats.skipped += 1;
            continue;
        };
        let img = match image::open(&src) {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!(path = %src.display(), error = %e, "cannot read source image; skipping");
                stats.skipped += 1;
                continue;
            }
        };
        if img.height() != entry.height || img.width() != entry.width {
            tracing::warn!(
                path = %src.display(),
                expected = ?(entry.height, entry.width),
                actual = ?(img.height(), img.width()),
                "source size differs from manifest; skipping"
            );
            stats.skipped += 1;
            continue;
        }

        let stem = stems.get(entry.id.as_str()).map_or(entry.id.as_str(), String::as_str);
        for plan in &entry.crops {
            let name = crop_file_name(stem, plan);
            if !written_names.insert(name.clone()) {
                bail!("crop name {name} already written by another image (id {})", entry.id);
            }
            save_crop(&img, plan.rect(), &out_dir.join(&name))?;
            stats.written += 1;
        }
    }

    tracing::info!(written = stats.written, skipped = stats.skipped, out = %out_dir.display(), "export complete");
    Ok(stats)
}

fn save_crop(img: &DynamicImage, rect: CropRect, dst: &Path) -> Result<()> {
    let side = rect.side();
    let crop = img.crop_imm(rect.x1, rect.y1, side, side).to_rgb8();

    let file = File::create(dst).with_context(|| format!("creating {}", dst.display()))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
        .encode_image(&crop)
        .with_context(|| format!("encoding {}", dst.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curate::curate;
    use crate::manifest::DetectionManifest;
    use image::{Rgb, RgbImage};
    use likeness_core::{center_square, CropMode, CropSpec, CurationConfig};

    #[test]
    fn test_crop_file_name() {
        let rect = center_square(4, 4).unwrap();
        let face = CropPlan::Framed(CropSpec { mode: CropMode::Face, rect });
        let body = CropPlan::Framed(CropSpec { mode: CropMode::Body, rect });
        let fallback = CropPlan::Fallback { rect };
        assert_eq!(crop_file_name("0001", &face), "face_0001.jpg");
        assert_eq!(crop_file_name("0001", &body), "body_0001.jpg");
        assert_eq!(crop_file_name("0001", &fallback), "0001.jpg");
    }

    #[test]
    fn test_output_stems_disambiguate_shared_stems() {
        let stems = output_stems(["a.png", "a.jpg", "x/b.jpg", "y/b.jpg", "c.jpg"]);
        assert_eq!(stems["a.png"], "a_png");
        assert_eq!(stems["a.jpg"], "a_jpg");
        assert_eq!(stems["x/b.jpg"], "x_b_jpg");
        assert_eq!(stems["y/b.jpg"], "y_b_jpg");
        assert_eq!(stems["c.jpg"], "c");
    }

    #[test]
    fn test_source_path_stays_inside_images_dir() {
        let dir = Path::new("/data/images");
        assert_eq!(source_path(dir, "a.jpg"), Some(dir.join("a.jpg")));
        assert_eq!(source_path(dir, "sub/a.jpg"), Some(dir.join("sub/a.jpg")));
        assert_eq!(source_path(dir, "../a.jpg"), None);
        assert_eq!(source_path(dir, "sub/../../a.jpg"), None);
        assert_eq!(source_path(dir, "/etc/passwd"), None);
        assert_eq!(source_path(dir, ""), None);
    }

    #[test]
    fn test_export_writes_square_crops_for_kept_images() {
        let src_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(80, 60, Rgb([120, 80, 40]))
            .save(src_dir.path().join("0001.png"))
            .unwrap();
        RgbImage::from_pixel(80, 60, Rgb([0, 0, 0]))
            .save(src_dir.path().join("0002.png"))
            .unwrap();

        let manifest = DetectionManifest::parse(
            r#"{"images": [
                {"id": "0001.png", "height": 60, "width": 80,
                 "faces": [{"bbox": [30, 20, 50, 40], "embedding": [1.0, 0.0]}]},
                {"id": "0002.png", "height": 60, "width": 80}
            ]}"#,
        )
        .unwrap();
        let report = curate(&manifest, &CurationConfig::default()).unwrap();

        let stats = export_crops(&report, src_dir.path(), out_dir.path()).unwrap();
        assert_eq!(stats, ExportStats { written: 2, skipped: 0 });

        // face: round(20 * 1.6) = 32; body: min(round(20 * 6.0), 60) = 60
        let face = image::open(out_dir.path().join("face_0001.jpg")).unwrap();
        assert_eq!((face.width(), face.height()), (32, 32));
        let body = image::open(out_dir.path().join("body_0001.jpg")).unwrap();
        assert_eq!((body.width(), body.height()), (60, 60));
        assert!(!out_dir.path().join("0002.jpg").exists());
    }

    #[test]
    fn test_export_skips_missing_and_resized_sources() {
        let src_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(40, 40, Rgb([1, 2, 3]))
            .save(src_dir.path().join("resized.png"))
            .unwrap();

        let manifest = DetectionManifest::parse(
            r#"{"images": [
                {"id": "missing.png", "height": 60, "width": 80,
                 "faces": [{"bbox": [30, 20, 50, 40], "embedding": [1.0, 0.0]}]},
                {"id": "resized.png", "height": 60, "width": 80,
                 "faces": [{"bbox": [30, 20, 50, 40], "embedding": [1.0, 0.0]}]}
            ]}"#,
        )
        .unwrap();
        let report = curate(&manifest, &CurationConfig::default()).unwrap();
        assert_eq!(report.summary.kept, 2);

        let stats = export_crops(&report, src_dir.path(), out_dir.path()).unwrap();
        assert_eq!(stats, ExportStats { written: 0, skipped: 2 });
    }

    #[test]
    fn test_export_keeps_crops_of_images_sharing_a_stem() {
        let src_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "a.jpg"] {
            RgbImage::from_pixel(80, 60, Rgb([90, 90, 90]))
                .save(src_dir.path().join(name))
                .unwrap();
        }

        let manifest = DetectionManifest::parse(
            r#"{"images": [
                {"id": "a.png", "height": 60, "width": 80,
                 "faces": [{"bbox": [30, 20, 50, 40], "embedding": [1.0, 0.0]}]},
                {"id": "a.jpg", "height": 60, "width": 80,
                 "faces": [{"bbox": [30, 20, 50, 40], "embedding": [1.0, 0.0]}]}
            ]}"#,
        )
        .unwrap();
        let report = curate(&manifest, &CurationConfig::default()).unwrap();

        let stats = export_crops(&report, src_dir.path(), out_dir.path()).unwrap();
        assert_eq!(stats, ExportStats { written: 4, skipped: 0 });
        let on_disk = std::fs::read_dir(out_dir.path()).unwrap().count();
        assert_eq!(on_disk, 4);
        for name in ["face_a_png.jpg", "body_a_png.jpg", "face_a_jpg.jpg", "body_a_jpg.jpg"] {
            assert!(out_dir.path().join(name).exists(), "missing {name}");
        }
    }

    #[test]
    fn test_export_skips_ids_outside_images_dir() {
        let root = tempfile::tempdir().unwrap();
        let images = root.path().join("images");
        std::fs::create_dir(&images).unwrap();
        RgbImage::from_pixel(80, 60, Rgb([5, 5, 5]))
            .save(root.path().join("outside.png"))
            .unwrap();
        let out_dir = tempfile::tempdir().unwrap();

        let manifest = DetectionManifest::parse(
            r#"{"images": [
                {"id": "../outside.png", "height": 60, "width": 80,
                 "faces": [{"bbox": [30, 20, 50, 40], "embedding": [1.0, 0.0]}]}
            ]}"#,
        )
        .unwrap();
        let report = curate(&manifest, &CurationConfig::default()).unwrap();

        let stats = export_crops(&report, &images, out_dir.path()).unwrap();
        assert_eq!(stats, ExportStats { written: 0, skipped: 1 });
        assert_eq!(std::fs::read_dir(out_dir.path()).unwrap().count(), 0);
    }
}
