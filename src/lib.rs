//! Image transformation routes for actix-web.
//!
//! Mounts a directory of images under a public route and applies
//! query-string driven transforms (resize, rotate, crop, blur) on the fly,
//! caching each encoded response for subsequent hits:
//!
//! ```text
//! GET /images/cat.png?fn=resize&rw=100
//! GET /images/cat.png?fn=rotate&fn=crop&rd=90&cw=200
//! ```
//!
//! ```no_run
//! use actix_web::{App, HttpServer};
//! use actix_images::{ImagesPlugin, ImagesPluginOptions};
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let plugin = ImagesPlugin::new(ImagesPluginOptions::default())
//!         .build()
//!         .await
//!         .expect("plugin configuration");
//!
//!     HttpServer::new(move || App::new().configure(|cfg| plugin.register(cfg)))
//!         .bind("0.0.0.0:8080")?
//!         .run()
//!         .await
//! }
//! ```

mod cache;
mod error;
mod handler;
mod keymap;
mod media;
mod middleware;
mod params;
mod transformers;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use actix_web::web;

pub use crate::cache::{
    build_cache, CacheConfig, CachedResponse, ImageCache, KvCache, MemoryCache, NoopCache,
    CACHE_HIT_HEADER, KV_HIT_HEADER,
};
pub use crate::error::AppError;
pub use crate::keymap::KeyMap;
pub use crate::media::{transform_frames, Media};
pub use crate::middleware::{MiddlewareOptions, RateLimitOptions};
pub use crate::params::{asset_url, get_param, parse_param, Query, TransformArgs};
pub use crate::transformers::{
    blur, builtin_transformers, crop, grayscale, resize, rotate, TransformFn, Transformer,
};

use crate::handler::{serve_image, ImagesState, RouteCtx};
use crate::middleware::{image_gate, Gate};

/// One-time build hook, run before any route is served. Meant for
/// ahead-of-time image processing.
pub type BuildHook = Box<dyn FnOnce() -> Result<(), AppError> + Send>;

/// Plugin configuration, consumed once by [`ImagesPlugin::build`].
pub struct ImagesPluginOptions {
    /// Public route prefix the plain transformers mount under.
    pub route: String,
    /// Local directory the requested file names resolve against.
    pub real_path: PathBuf,
    /// Static asset directory checked for route shadowing at startup.
    pub static_dir: PathBuf,
    /// Transformer registrations, keyed by the `fn` name clients use.
    pub transformers: HashMap<String, Transformer>,
    /// Extra parameter aliases merged over the builtin keymap.
    pub keymap: KeyMap,
    /// Optional one-time hook run at build time.
    pub build_hook: Option<BuildHook>,
    /// Hotlink/rate-limit gate settings.
    pub middleware: MiddlewareOptions,
    /// Cache backend selection; `None` resolves from the environment.
    pub cache: Option<CacheConfig>,
    /// Re-encode every response as JPEG (first frame only for animations).
    pub jpeg: bool,
}

impl Default for ImagesPluginOptions {
    fn default() -> Self {
        ImagesPluginOptions {
            route: "/images".to_string(),
            real_path: PathBuf::from("./static/image"),
            static_dir: PathBuf::from("./static"),
            transformers: builtin_transformers(),
            keymap: KeyMap::default(),
            build_hook: None,
            middleware: MiddlewareOptions::default(),
            cache: None,
            jpeg: false,
        }
    }
}

/// The plugin assembler. `build` validates the configuration, runs the build
/// hook, selects the cache backend, and produces the route table.
pub struct ImagesPlugin {
    options: ImagesPluginOptions,
}

struct Mount {
    prefix: String,
    transformer_key: Option<String>,
}

impl ImagesPlugin {
    pub fn new(options: ImagesPluginOptions) -> Self {
        ImagesPlugin { options }
    }

    pub async fn build(self) -> Result<BuiltImagesPlugin, AppError> {
        let mut options = self.options;

        validate_route(&options.route, &options.static_dir)?;

        if let Some(hook) = options.build_hook.take() {
            hook()?;
        }

        let cache_config = options.cache.take().unwrap_or_else(CacheConfig::from_env);
        let cache = build_cache(&cache_config).await;

        let mut mounts = Vec::new();
        let mut has_plain = false;
        for (key, transformer) in &options.transformers {
            match transformer {
                Transformer::Plain(_) => has_plain = true,
                Transformer::Routed { path, .. } => mounts.push(Mount {
                    prefix: normalize_prefix(path),
                    transformer_key: Some(key.clone()),
                }),
            }
        }
        // all plain registrations share one mount under the route prefix
        if has_plain {
            mounts.push(Mount {
                prefix: normalize_prefix(&options.route),
                transformer_key: None,
            });
        }

        let gate = Arc::new(Gate::new(options.middleware, cache_config.emit_headers));
        let state = web::Data::new(ImagesState {
            cache,
            transformers: options.transformers,
            real_path: options.real_path,
            keymap: options.keymap,
            jpeg: options.jpeg,
        });

        Ok(BuiltImagesPlugin {
            state,
            gate,
            mounts: mounts.into(),
        })
    }
}

/// The assembled plugin: pass [`register`](BuiltImagesPlugin::register) to
/// `App::configure`. Cloneable so the `HttpServer` factory closure can own
/// it.
#[derive(Clone)]
pub struct BuiltImagesPlugin {
    state: web::Data<ImagesState>,
    gate: Arc<Gate>,
    mounts: Arc<[Mount]>,
}

impl BuiltImagesPlugin {
    pub fn register(&self, cfg: &mut web::ServiceConfig) {
        for mount in self.mounts.iter() {
            let gate = Arc::clone(&self.gate);
            let scope = web::scope(&mount.prefix)
                .app_data(self.state.clone())
                .app_data(web::Data::new(RouteCtx {
                    transformer_key: mount.transformer_key.clone(),
                }))
                .wrap(actix_web::middleware::from_fn(move |req, next| {
                    let gate = Arc::clone(&gate);
                    async move { image_gate(gate, req, next).await }
                }))
                .route("/{filename:.*}", web::get().to(serve_image));
            cfg.service(scope);
        }
    }
}

/// Fail fast when the route prefix would shadow an existing static asset
/// directory: the host framework would otherwise resolve those paths to the
/// static files and the transform routes would silently never fire.
fn validate_route(route: &str, static_dir: &Path) -> Result<(), AppError> {
    let leaf = route.trim_matches('/');
    if leaf.is_empty() {
        return Err(AppError::Config("route prefix must not be empty".into()));
    }
    let shadowed = static_dir.join(leaf);
    if shadowed.is_dir() {
        return Err(AppError::Config(format!(
            "route prefix {route:?} collides with the static asset directory {}",
            shadowed.display()
        )));
    }
    Ok(())
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    format!("/{trimmed}")
}
