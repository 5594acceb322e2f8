//! Request Interceptor
//!
//! The surface the browser shell calls for every outgoing request and every
//! page load. Requests are checked before any DNS lookup or socket is opened,
//! so a blocked request costs one engine decision and nothing else.
//!
//! Flow:
//! 1. Shell hands over request URL, source page URL and resource type string
//! 2. Engine decision (cache, then rule scan)
//! 3. If blocked → return Blocked immediately (no DNS, no socket)
//! 4. If allowed → the shell proceeds with the request

use crate::engine::{AdBlockEngine, DecisionReason};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

/// Result of interception check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptResult {
    /// Request is allowed to proceed
    Allow,
    /// Request is blocked
    Blocked {
        reason: DecisionReason,
        /// Time spent in filter check (microseconds)
        check_time_us: u64,
    },
}

impl InterceptResult {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Type of resource being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// Main document
    Document,
    /// Frame or iframe
    Subdocument,
    /// CSS stylesheet
    Stylesheet,
    /// JavaScript
    Script,
    /// Image
    Image,
    /// Font
    Font,
    /// XHR/Fetch request
    XmlHttpRequest,
    /// WebSocket
    WebSocket,
    /// Media (video/audio)
    Media,
    /// Plugin content
    Object,
    /// Beacon or hyperlink auditing
    Ping,
    /// Other/Unknown
    Other,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Subdocument => "subdocument",
            Self::Stylesheet => "stylesheet",
            Self::Script => "script",
            Self::Image => "image",
            Self::Font => "font",
            Self::XmlHttpRequest => "xmlhttprequest",
            Self::WebSocket => "websocket",
            Self::Media => "media",
            Self::Object => "object",
            Self::Ping => "ping",
            Self::Other => "other",
        }
    }

    /// Parse from Accept header or file extension
    pub fn from_accept_or_path(accept: Option<&str>, path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or(path);

        // Check file extension first
        if path.ends_with(".js") || path.ends_with(".mjs") {
            return Self::Script;
        }
        if path.ends_with(".css") {
            return Self::Stylesheet;
        }
        if path.ends_with(".woff") || path.ends_with(".woff2") || path.ends_with(".ttf") {
            return Self::Font;
        }
        if path.ends_with(".png")
            || path.ends_with(".jpg")
            || path.ends_with(".jpeg")
            || path.ends_with(".gif")
            || path.ends_with(".webp")
            || path.ends_with(".svg")
        {
            return Self::Image;
        }
        if path.ends_with(".mp4")
            || path.ends_with(".webm")
            || path.ends_with(".mp3")
            || path.ends_with(".ogg")
        {
            return Self::Media;
        }

        // Check Accept header
        if let Some(accept) = accept {
            if accept.contains("text/html") {
                return Self::Document;
            }
            if accept.contains("text/css") {
                return Self::Stylesheet;
            }
            if accept.contains("javascript") {
                return Self::Script;
            }
            if accept.contains("image/") {
                return Self::Image;
            }
            if accept.contains("font/") {
                return Self::Font;
            }
        }

        Self::Other
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = std::convert::Infallible;

    /// Shell type strings, case-insensitive. Unknown names map to `Other`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "document" | "main_frame" | "mainframe" => Self::Document,
            "subdocument" | "sub_frame" | "subframe" | "frame" | "iframe" => Self::Subdocument,
            "stylesheet" | "css" => Self::Stylesheet,
            "script" => Self::Script,
            "image" | "imageset" => Self::Image,
            "font" => Self::Font,
            "xmlhttprequest" | "xhr" | "fetch" => Self::XmlHttpRequest,
            "websocket" => Self::WebSocket,
            "media" => Self::Media,
            "object" | "object_subrequest" => Self::Object,
            "ping" | "beacon" => Self::Ping,
            _ => Self::Other,
        })
    }
}

fn resolve_kind(request_url: &str, resource_kind: &str) -> ResourceType {
    match resource_kind.parse().unwrap_or(ResourceType::Other) {
        ResourceType::Other => {
            let path = url::Url::parse(request_url)
                .map(|u| u.path().to_ascii_lowercase())
                .unwrap_or_else(|_| request_url.to_ascii_lowercase());
            ResourceType::from_accept_or_path(None, &path)
        }
        kind => kind,
    }
}

/// Interception statistics
#[derive(Debug, Default)]
pub struct InterceptorStats {
    pub total_requests: AtomicU64,
    pub blocked_requests: AtomicU64,
    pub total_check_time_ns: AtomicU64,
}

/// Request interceptor backed by the engine
pub struct RequestInterceptor {
    engine: Arc<AdBlockEngine>,
    /// Statistics
    stats: InterceptorStats,
}

impl RequestInterceptor {
    pub fn new(engine: Arc<AdBlockEngine>) -> Self {
        Self {
            engine,
            stats: InterceptorStats::default(),
        }
    }

    pub fn engine(&self) -> &Arc<AdBlockEngine> {
        &self.engine
    }

    /// Check if a request should be intercepted (blocked)
    ///
    /// This is the HOT PATH.
    #[inline]
    pub fn check(&self, url: &str, source_url: &str, resource_type: ResourceType) -> InterceptResult {
        let start = Instant::now();
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let decision = self.engine.decide_detailed(url, source_url, resource_type);

        let elapsed = start.elapsed().as_nanos() as u64;
        self.stats.total_check_time_ns.fetch_add(elapsed, Ordering::Relaxed);

        if !decision.blocked {
            return InterceptResult::Allow;
        }

        self.stats.blocked_requests.fetch_add(1, Ordering::Relaxed);
        debug!("Intercepted {} {} ({} ns)", resource_type, url, elapsed);
        InterceptResult::Blocked {
            reason: decision.reason,
            check_time_us: elapsed / 1000,
        }
    }

    /// Block verdict for the shell's request hook
    ///
    /// An empty or unknown kind is inferred from the request path.
    pub fn should_block_request(&self, request_url: &str, source_url: &str, resource_kind: &str) -> bool {
        let kind = resolve_kind(request_url, resource_kind);
        self.check(request_url, source_url, kind).is_blocked()
    }

    /// Element-hiding stylesheet to inject into a page
    pub fn get_css_rules(&self, page_url: &str) -> String {
        self.engine.get_css_rules(page_url)
    }

    /// Scripts to inject into a page
    pub fn get_js_rules(&self, page_url: &str) -> String {
        self.engine.get_js_rules(page_url)
    }

    pub fn get_element_hiding_selectors(&self, page_url: &str) -> Vec<String> {
        self.engine.get_element_hiding_selectors(page_url)
    }

    /// Get statistics
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.total_requests.load(Ordering::Relaxed),
            self.stats.blocked_requests.load(Ordering::Relaxed),
            self.stats.total_check_time_ns.load(Ordering::Relaxed),
        )
    }

    /// Get average check time in nanoseconds
    pub fn avg_check_time_ns(&self) -> u64 {
        let total = self.stats.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        self.stats.total_check_time_ns.load(Ordering::Relaxed) / total
    }
}
