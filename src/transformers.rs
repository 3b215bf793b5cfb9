use std::collections::HashMap;
use std::sync::Arc;

use image::imageops::FilterType;
use log::warn;
use photon_rs::{conv, monochrome, transform};

use crate::error::AppError;
use crate::media::{from_photon, to_photon, transform_frames, Media};
use crate::params::{Query, TransformArgs};

/// A named, stateless operation on a decoded image.
pub type TransformFn = Arc<dyn Fn(Media, &TransformArgs) -> Result<Media, AppError> + Send + Sync>;

/// A transformer registration: either mounted under the plugin's shared route
/// prefix, or carrying its own dedicated path.
#[derive(Clone)]
pub enum Transformer {
    Plain(TransformFn),
    Routed { path: String, handler: TransformFn },
}

impl Transformer {
    pub fn plain<F>(f: F) -> Self
    where
        F: Fn(Media, &TransformArgs) -> Result<Media, AppError> + Send + Sync + 'static,
    {
        Transformer::Plain(Arc::new(f))
    }

    pub fn routed<F>(path: impl Into<String>, f: F) -> Self
    where
        F: Fn(Media, &TransformArgs) -> Result<Media, AppError> + Send + Sync + 'static,
    {
        Transformer::Routed {
            path: path.into(),
            handler: Arc::new(f),
        }
    }

    fn handler(&self) -> &TransformFn {
        match self {
            Transformer::Plain(f) => f,
            Transformer::Routed { handler, .. } => handler,
        }
    }
}

/// Ordered transformer names for one request: every repeated `fn` query value,
/// then the key a transform-specific route injects for its own mount.
pub fn transformer_names(query: &Query, route_key: Option<&str>) -> Vec<String> {
    let mut names: Vec<String> = query.get_all("fn").map(str::to_string).collect();
    if let Some(key) = route_key {
        names.push(key.to_string());
    }
    names
}

/// Left-fold the named transforms over the image. Names with no registration
/// are skipped: a malformed query degrades to serving the unmodified image.
pub fn apply(
    media: Media,
    names: &[String],
    registry: &HashMap<String, Transformer>,
    args: &TransformArgs,
) -> Result<Media, AppError> {
    let mut media = media;
    for name in names {
        match registry.get(name) {
            Some(transformer) => media = transformer.handler()(media, args)?,
            None => warn!("skipping unknown transformer: {name}"),
        }
    }
    Ok(media)
}

/// Scale to `resizeWidth`/`resizeHeight`. A missing dimension is derived from
/// the aspect ratio; with neither present the image passes through untouched.
pub fn resize(media: Media, args: &TransformArgs) -> Result<Media, AppError> {
    let width: Option<u32> = args.param("resizeWidth");
    let height: Option<u32> = args.param("resizeHeight");

    if width.is_none() && height.is_none() {
        return Ok(media);
    }

    transform_frames(media, move |img| {
        let (tw, th) = target_dimensions(img.width(), img.height(), width, height);
        Ok(img.resize_exact(tw, th, FilterType::Lanczos3))
    })
}

fn target_dimensions(iw: u32, ih: u32, width: Option<u32>, height: Option<u32>) -> (u32, u32) {
    let scale = |len: u32, num: u32, den: u32| -> u32 {
        ((len as u64 * num as u64) / den.max(1) as u64).max(1) as u32
    };
    match (width, height) {
        (Some(w), Some(h)) => (w.max(1), h.max(1)),
        (Some(w), None) => (w.max(1), scale(ih, w.max(1), iw)),
        (None, Some(h)) => (scale(iw, h.max(1), ih), h.max(1)),
        (None, None) => (iw, ih),
    }
}

/// Rotate by `rotateDegrees` (signed, any magnitude) through the photon
/// backend, which handles arbitrary angles.
pub fn rotate(media: Media, args: &TransformArgs) -> Result<Media, AppError> {
    let degrees: f32 = args.param_or("rotateDegrees", 0.0);

    transform_frames(media, move |img| {
        let photon = to_photon(&img);
        from_photon(transform::rotate(&photon, degrees))
    })
}

/// Cut out the rectangle described by `cropStartX`/`cropStartY` (default 0)
/// and `cropWidth`/`cropHeight` (default: to the image edge). The rectangle
/// is clamped to the source bounds; one that lies entirely outside them is a
/// transform error.
pub fn crop(media: Media, args: &TransformArgs) -> Result<Media, AppError> {
    let x: u32 = args.param_or("cropStartX", 0);
    let y: u32 = args.param_or("cropStartY", 0);
    let width: Option<u32> = args.param("cropWidth");
    let height: Option<u32> = args.param("cropHeight");

    transform_frames(media, move |img| {
        let (iw, ih) = (img.width(), img.height());
        if x >= iw || y >= ih {
            return Err(AppError::Transform(format!(
                "crop start ({x}, {y}) lies outside the {iw}x{ih} image"
            )));
        }
        let w = width.unwrap_or(iw - x).clamp(1, iw - x);
        let h = height.unwrap_or(ih - y).clamp(1, ih - y);
        Ok(img.crop_imm(x, y, w, h))
    })
}

/// Gaussian blur. `blurRadius` goes to the photon backend's convolution;
/// `blurSigma` alone falls back to the primary codec's gaussian filter.
pub fn blur(media: Media, args: &TransformArgs) -> Result<Media, AppError> {
    let radius: Option<i32> = args.param("blurRadius");
    let sigma: Option<f32> = args.param("blurSigma");

    transform_frames(media, move |img| match (radius, sigma) {
        (Some(r), _) => {
            let mut photon = to_photon(&img);
            conv::gaussian_blur(&mut photon, r);
            from_photon(photon)
        }
        (None, Some(s)) => Ok(img.blur(s)),
        (None, None) => Ok(img),
    })
}

/// Desaturate via the photon backend. Parameterless.
pub fn grayscale(media: Media, _args: &TransformArgs) -> Result<Media, AppError> {
    transform_frames(media, |img| {
        let mut photon = to_photon(&img);
        monochrome::grayscale(&mut photon);
        from_photon(photon)
    })
}

/// The builtin registry: resize, rotate, crop, and blur under the shared
/// route prefix. Mirrors what most integrations register by hand.
pub fn builtin_transformers() -> HashMap<String, Transformer> {
    HashMap::from([
        ("resize".to_string(), Transformer::plain(resize)),
        ("rotate".to_string(), Transformer::plain(rotate)),
        ("crop".to_string(), Transformer::plain(crop)),
        ("blur".to_string(), Transformer::plain(blur)),
    ])
}
