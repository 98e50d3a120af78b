//! Request classification by URL path.

use crate::config::RoutesConfig;

/// Category of an intercepted request, which decides its caching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
  /// Application shell: pages and static assets needed to render offline
  Shell,
  /// Data endpoints whose responses go stale quickly
  Api,
  /// Everything else
  Other,
}

/// Maps request paths to a [`Category`].
#[derive(Debug, Clone)]
pub struct RouteClassifier {
  shell_routes: Vec<String>,
  api_root: String,
  mutation_marker: String,
}

impl RouteClassifier {
  pub fn new(shell_routes: Vec<String>, api_root: String, mutation_marker: String) -> Self {
    Self {
      shell_routes,
      api_root,
      mutation_marker,
    }
  }

  pub fn from_config(config: &RoutesConfig) -> Self {
    Self::new(
      config.shell.clone(),
      config.api_root.clone(),
      config.mutation_marker.clone(),
    )
  }

  /// Classify a URL path. Shell routes are checked before API routes.
  pub fn classify(&self, path: &str) -> Category {
    if self.is_shell(path) {
      Category::Shell
    } else if self.is_api(path) {
      Category::Api
    } else {
      Category::Other
    }
  }

  fn is_shell(&self, path: &str) -> bool {
    self.shell_routes.iter().any(|route| match route.as_str() {
      "" => false,
      // Every path starts with "/", so the root only matches itself
      "/" => path == "/",
      prefix => path.starts_with(prefix),
    })
  }

  fn is_api(&self, path: &str) -> bool {
    (!self.api_root.is_empty() && path.starts_with(&self.api_root))
      || (!self.mutation_marker.is_empty() && path.contains(&self.mutation_marker))
  }
}
