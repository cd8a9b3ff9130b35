//! Request classification.

use reqwest::Method;
use url::Url;

use crate::http::Request;

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg"];
const STATIC_EXTENSIONS: &[&str] = &[".js", ".css", ".woff", ".ttf"];
const API_PREFIX: &str = "/api/";

/// The resource class a request falls into; each class has one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  Image,
  Api,
  StaticAsset,
  Navigation,
}

#[derive(Debug, Clone)]
pub struct Classifier {
  /// Substrings identifying the backend service host (e.g. "supabase.co")
  backend_hosts: Vec<String>,
  /// Path prefixes of bundler output (e.g. "/_next/static/")
  static_prefixes: Vec<String>,
}

impl Classifier {
  pub fn new(backend_hosts: Vec<String>, static_prefixes: Vec<String>) -> Self {
    Self {
      backend_hosts,
      static_prefixes,
    }
  }

  /// Classify by URL. Image wins over API and static when a path matches several.
  pub fn classify(&self, url: &Url) -> RequestClass {
    let path = url.path().to_ascii_lowercase();

    if IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
      return RequestClass::Image;
    }

    let host = url.host_str().unwrap_or_default();
    if path.starts_with(API_PREFIX)
      || self
        .backend_hosts
        .iter()
        .any(|h| !h.is_empty() && host.contains(h.as_str()))
    {
      return RequestClass::Api;
    }

    if self
      .static_prefixes
      .iter()
      .any(|prefix| url.path().starts_with(prefix.as_str()))
      || STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    {
      return RequestClass::StaticAsset;
    }

    RequestClass::Navigation
  }
}

/// Only GET requests over http(s) are routed; everything else goes straight out.
pub fn should_intercept(request: &Request) -> bool {
  request.method == Method::GET && request.is_http()
}
