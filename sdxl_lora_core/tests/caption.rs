use std::path::Path;

use anyhow::Result;
use image::{DynamicImage, RgbImage};
use sdxl_lora_core::{
    caption::{caption_directory, ensure_image_dir, iter_images, CaptionOptions, Captioner},
    CaptionError,
};

/// Returns the same caption for every image and counts its calls.
#[derive(Default)]
struct FakeCaptioner {
    calls: usize,
}

impl Captioner for FakeCaptioner {
    fn caption(&mut self, image: &DynamicImage, _max_new_tokens: usize) -> Result<String> {
        assert!(matches!(image, DynamicImage::ImageRgb8(_)));
        self.calls += 1;
        Ok(" a dummy caption ".to_string())
    }
}

/// Fails on its `fail_at`-th call (counting from one).
struct FailingCaptioner {
    calls: usize,
    fail_at: usize,
}

impl Captioner for FailingCaptioner {
    fn caption(&mut self, _image: &DynamicImage, _max_new_tokens: usize) -> Result<String> {
        self.calls += 1;
        if self.calls == self.fail_at {
            anyhow::bail!("out of memory");
        }
        Ok("a caption".to_string())
    }
}

fn write_image(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    RgbImage::new(4, 4).save(path)?;
    Ok(())
}

#[test]
fn lists_supported_images_only() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(&dir.path().join("x.jpg"))?;
    std::fs::write(dir.path().join("y.txt"), "not an image")?;
    write_image(&dir.path().join("z.webp"))?;

    let images = iter_images(dir.path())?;
    assert_eq!(
        images,
        vec![dir.path().join("x.jpg"), dir.path().join("z.webp")]
    );
    Ok(())
}

#[test]
fn lists_nested_images_in_path_order() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(&dir.path().join("b/c.png"))?;
    write_image(&dir.path().join("a.PNG"))?;
    write_image(&dir.path().join("b/a.bmp"))?;
    write_image(&dir.path().join("c.jpeg"))?;
    std::fs::create_dir_all(dir.path().join("d.png"))?;

    let images = iter_images(dir.path())?;
    let relative = images
        .iter()
        .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
        .collect::<Vec<_>>();
    assert_eq!(
        relative,
        vec![
            Path::new("a.PNG"),
            Path::new("b/a.bmp"),
            Path::new("b/c.png"),
            Path::new("c.jpeg"),
        ]
    );
    Ok(())
}

#[test]
fn writes_prefixed_captions_next_to_images() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(&dir.path().join("x.jpg"))?;
    write_image(&dir.path().join("sub/y.png"))?;

    let mut captioner = FakeCaptioner::default();
    let options = CaptionOptions {
        prefix: "sksSubject".to_string(),
        ..Default::default()
    };
    let summary = caption_directory(dir.path(), &mut captioner, &options)?;

    assert_eq!(summary.captioned, 2);
    assert_eq!(summary.skipped, 0);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("x.txt"))?,
        "sksSubject a dummy caption\n"
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("sub/y.txt"))?,
        "sksSubject a dummy caption\n"
    );
    Ok(())
}

#[test]
fn existing_captions_are_kept_unless_overwriting() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(&dir.path().join("x.jpg"))?;
    std::fs::write(dir.path().join("x.txt"), "hand written\n")?;

    let mut captioner = FakeCaptioner::default();
    let summary = caption_directory(dir.path(), &mut captioner, &CaptionOptions::default())?;
    assert_eq!(summary.skipped, 1);
    assert_eq!(captioner.calls, 0);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("x.txt"))?,
        "hand written\n"
    );

    let options = CaptionOptions {
        overwrite: true,
        ..Default::default()
    };
    caption_directory(dir.path(), &mut captioner, &options)?;
    caption_directory(dir.path(), &mut captioner, &options)?;
    assert_eq!(captioner.calls, 2);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("x.txt"))?,
        "a dummy caption\n"
    );
    Ok(())
}

#[test]
fn reruns_without_overwrite_change_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(&dir.path().join("x.jpg"))?;

    let mut captioner = FakeCaptioner::default();
    caption_directory(dir.path(), &mut captioner, &CaptionOptions::default())?;
    let first = std::fs::read_to_string(dir.path().join("x.txt"))?;
    let summary = caption_directory(dir.path(), &mut captioner, &CaptionOptions::default())?;

    assert_eq!(summary.captioned, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(std::fs::read_to_string(dir.path().join("x.txt"))?, first);
    Ok(())
}

#[test]
fn images_are_decoded_by_content_not_extension() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(&dir.path().join("x.png"))?;
    std::fs::rename(dir.path().join("x.png"), dir.path().join("x.jpg"))?;

    let mut captioner = FakeCaptioner::default();
    let summary = caption_directory(dir.path(), &mut captioner, &CaptionOptions::default())?;
    assert_eq!(summary.captioned, 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("x.txt"))?,
        "a dummy caption\n"
    );
    Ok(())
}

#[test]
fn first_failure_aborts_the_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for name in ["a.png", "b.png", "c.png"] {
        write_image(&dir.path().join(name))?;
    }

    let mut captioner = FailingCaptioner { calls: 0, fail_at: 2 };
    let err = caption_directory(dir.path(), &mut captioner, &CaptionOptions::default()).unwrap_err();
    assert_eq!(err.to_string(), "out of memory");
    assert_eq!(captioner.calls, 2);
    assert!(dir.path().join("a.txt").exists());
    assert!(!dir.path().join("b.txt").exists());
    assert!(!dir.path().join("c.txt").exists());
    Ok(())
}

#[test]
fn unreadable_images_abort_the_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(&dir.path().join("a.png"))?;
    std::fs::write(dir.path().join("b.jpg"), b"not an image")?;
    write_image(&dir.path().join("c.png"))?;

    let mut captioner = FakeCaptioner::default();
    let err = caption_directory(dir.path(), &mut captioner, &CaptionOptions::default()).unwrap_err();
    assert!(err.to_string().starts_with("Failed to open image"));
    assert_eq!(captioner.calls, 1);
    assert!(dir.path().join("a.txt").exists());
    assert!(!dir.path().join("c.txt").exists());
    Ok(())
}

#[test]
fn missing_directory_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let missing = dir.path().join("missing");
    let err = ensure_image_dir(&missing).unwrap_err();
    assert!(matches!(err, CaptionError::NotADirectory(_)));
    assert!(err.to_string().starts_with("Not a directory: "));

    let file = dir.path().join("x.jpg");
    write_image(&file)?;
    assert!(ensure_image_dir(&file).is_err());
    assert!(caption_directory(&file, &mut FakeCaptioner::default(), &CaptionOptions::default()).is_err());
    Ok(())
}
