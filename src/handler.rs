use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use log::{debug, error, info};

use crate::cache::{CachedResponse, ImageCache};
use crate::error::AppError;
use crate::keymap::KeyMap;
use crate::media::Media;
use crate::params::{Query, TransformArgs};
use crate::transformers::{self, Transformer};

/// Process-scoped plugin state, built once and shared by every mounted route.
pub(crate) struct ImagesState {
    pub cache: Arc<dyn ImageCache>,
    pub transformers: HashMap<String, Transformer>,
    pub real_path: PathBuf,
    pub keymap: KeyMap,
    pub jpeg: bool,
}

/// Per-mount context: a transform-specific route injects its transformer key
/// into every request it dispatches.
pub(crate) struct RouteCtx {
    pub transformer_key: Option<String>,
}

/// The image request pipeline: cache lookup, then on a miss
/// fetch -> decode -> transform -> encode -> store -> respond.
pub(crate) async fn serve_image(
    req: HttpRequest,
    state: web::Data<ImagesState>,
    ctx: web::Data<RouteCtx>,
) -> Result<HttpResponse, AppError> {
    let url = req.uri().to_string();
    let args = TransformArgs::new(Query::parse(req.query_string()), state.keymap.clone());
    let use_cache = !args.flag("noCache");

    if use_cache {
        if let Some(cached) = state.cache.get(&url).await {
            debug!("cache hit: {url}");
            return Ok(build_response(&cached));
        }
    }

    info!(
        "processing image request: {url} (route transformer: {:?})",
        ctx.transformer_key
    );

    let file_name = req.match_info().query("filename");
    let path = resolve_source(&state.real_path, file_name)?;
    let bytes = fetch_source(&path).await?;

    let media = Media::decode(&bytes)?;
    let names = transformers::transformer_names(&args.query, ctx.transformer_key.as_deref());
    let media = transformers::apply(media, &names, &state.transformers, &args)?;

    let quality = args.param_or("quality", 5u32);
    let (body, content_type) = media.encode(quality, state.jpeg)?;

    let response = CachedResponse::new(body, content_type);
    if use_cache {
        // last writer wins on a miss stampede; the put is idempotent
        state.cache.put(&url, &response).await;
    }

    Ok(build_response(&response))
}

/// Resolve the request's file name against the configured base directory.
/// Segments that would escape the base directory are rejected outright,
/// before any filesystem access.
pub(crate) fn resolve_source(base: &Path, file_name: &str) -> Result<PathBuf, AppError> {
    let mut path = base.to_path_buf();
    for segment in file_name.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment == ".." || segment.contains('\\') || Path::new(segment).is_absolute() {
            return Err(AppError::PathRejected(file_name.to_string()));
        }
        path.push(segment);
    }
    if path == base {
        return Err(AppError::PathRejected(file_name.to_string()));
    }
    Ok(path)
}

async fn fetch_source(path: &Path) -> Result<Bytes, AppError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes.into()),
        Err(source) => {
            error!("source fetch failed for {}: {source}", path.display());
            Err(AppError::Fetch {
                path: path.display().to_string(),
                source,
            })
        }
    }
}

fn build_response(cached: &CachedResponse) -> HttpResponse {
    let mut builder = HttpResponse::Ok();
    for (name, value) in &cached.headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    builder.body(cached.body.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_joins_nested_segments() {
        let path = resolve_source(Path::new("/srv/img"), "cats/tabby.png").unwrap();
        assert_eq!(path, Path::new("/srv/img/cats/tabby.png"));
    }

    #[test]
    fn resolve_skips_empty_and_dot_segments() {
        let path = resolve_source(Path::new("/srv/img"), "./cats//tabby.png").unwrap();
        assert_eq!(path, Path::new("/srv/img/cats/tabby.png"));
    }

    #[test]
    fn resolve_rejects_traversal() {
        assert!(resolve_source(Path::new("/srv/img"), "../secret.png").is_err());
        assert!(resolve_source(Path::new("/srv/img"), "cats/../../secret.png").is_err());
        assert!(resolve_source(Path::new("/srv/img"), "..\\secret.png").is_err());
    }

    #[test]
    fn resolve_rejects_empty_name() {
        assert!(resolve_source(Path::new("/srv/img"), "").is_err());
        assert!(resolve_source(Path::new("/srv/img"), "./").is_err());
    }
}
