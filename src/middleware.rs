use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::body::{BoxBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::{HeaderName, HeaderValue, REFERER};
use actix_web::middleware::Next;
use actix_web::ResponseError;
use dashmap::DashMap;
use log::debug;

use crate::error::AppError;

pub(crate) const RATE_LIMIT_HEADER: &str = "x-images-rate-limit";

/// Rate-limit settings: at most `max_requests` per client address per
/// `window`.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitOptions {
    pub max_requests: u64,
    pub window: Duration,
}

/// Optional request gates applied before the image handler. Both are off by
/// default: cross-origin embedding is legitimate for many sites.
#[derive(Clone, Copy, Debug, Default)]
pub struct MiddlewareOptions {
    /// Reject requests whose referer names another host.
    pub hotlink: bool,
    pub rate_limit: Option<RateLimitOptions>,
}

struct Window {
    count: u64,
    expires_at: Instant,
}

/// Shared gate state; counters live in a concurrent map so concurrent hits
/// from one address never lose updates.
pub(crate) struct Gate {
    hotlink: bool,
    rate_limit: Option<RateLimitOptions>,
    emit_headers: bool,
    hits: DashMap<String, Window>,
}

impl Gate {
    pub(crate) fn new(options: MiddlewareOptions, emit_headers: bool) -> Self {
        // IMAGES_RATE_LIMIT=false switches the limiter off without a redeploy
        let enabled = !matches!(
            std::env::var("IMAGES_RATE_LIMIT").as_deref(),
            Ok("false") | Ok("0")
        );
        Gate {
            hotlink: options.hotlink,
            rate_limit: options.rate_limit.filter(|_| enabled),
            emit_headers,
            hits: DashMap::new(),
        }
    }

    /// Count a hit and return the remaining budget, or `None` when the
    /// address is over its limit for the current window.
    fn register_hit(&self, ip: &str, limit: RateLimitOptions) -> Option<u64> {
        let now = Instant::now();
        let mut window = self.hits.entry(ip.to_string()).or_insert_with(|| Window {
            count: 0,
            expires_at: now + limit.window,
        });
        if now >= window.expires_at {
            window.count = 0;
            window.expires_at = now + limit.window;
        }
        window.count += 1;
        limit.max_requests.checked_sub(window.count)
    }
}

/// Hotlink rejection plus rate limiting, in that order. Mounted via
/// `middleware::from_fn` on every plugin scope.
pub(crate) async fn image_gate(
    gate: Arc<Gate>,
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<BoxBody>, actix_web::Error> {
    // A referer from another host means the image is being hotlinked.
    if gate.hotlink {
        if let Some(referer) = req.headers().get(REFERER).and_then(|v| v.to_str().ok()) {
            let host = req.connection_info().host().to_string();
            if !referer.contains(&format!("//{host}/")) {
                debug!("hotlink rejected: referer {referer} for host {host}");
                return Ok(req.into_response(AppError::Hotlink.error_response()));
            }
        }
    }

    let Some(limit) = gate.rate_limit else {
        let res = next.call(req).await?;
        return Ok(res.map_into_boxed_body());
    };

    let ip = client_ip(&req);
    // localhost always bypasses the limit
    if ip == "127.0.0.1" {
        let res = next.call(req).await?;
        return Ok(res.map_into_boxed_body());
    }

    let Some(remaining) = gate.register_hit(&ip, limit) else {
        debug!("rate limit exceeded for {ip}");
        return Ok(req.into_response(AppError::RateLimited.error_response()));
    };

    let mut res = next.call(req).await?.map_into_boxed_body();
    if gate.emit_headers {
        if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
            res.headers_mut()
                .insert(HeaderName::from_static(RATE_LIMIT_HEADER), value);
        }
    }
    Ok(res)
}

fn client_ip(req: &ServiceRequest) -> String {
    let header_ip = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    header_ip("x-forwarded-for")
        .or_else(|| header_ip("x-real-ip"))
        .or_else(|| req.peer_addr().map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
