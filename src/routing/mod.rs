//! Mount resolution — the hostname + path-prefix routing table
//!
//! A [`RoutingTable`] is built from a set of applications and queried per
//! request. Precedence: hostname-independent path-prefix mounts, then exact
//! hostname, then hostname regexps in insertion order. Within a mount list
//! the longest prefix wins.
//!
//! Tables are immutable snapshots; reloads build a fresh table and publish it
//! with an atomic pointer swap, so resolution never takes a lock.

pub mod host_pattern;

use crate::backend::{BackendFactory, Handler};
use crate::config::{Application, FrontendKind};
use crate::error::{EdgeError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

/// A materialized routing entry: one frontend of one app, bound to a handler
#[derive(Clone)]
pub struct Mount {
    pub prefix: String,
    pub strip_prefix: bool,
    pub allow_insecure_http: bool,
    pub app: Application,
    pub backend: Arc<dyn Handler>,
}

/// Mounts ordered from longest prefix to shortest, so `/foo/bar` is
/// considered before `/foo` before `/`
pub type MountList = Vec<Mount>;

struct HostnameRegexpMounts {
    regexp: Regex,
    mounts: MountList,
}

/// Immutable snapshot of the routing state at one point in time
pub struct RoutingTable {
    by_hostname: HashMap<String, MountList>,
    by_hostname_regexp: Vec<HostnameRegexpMounts>,
    /// Hostname-independent rules like `/.well-known/acme-challenge/`
    by_path_prefix: MountList,
    apps: Vec<Application>,
    timestamp: SystemTime,
}

impl RoutingTable {
    /// An empty table (used before the first successful discovery sync)
    pub fn empty(timestamp: SystemTime) -> Self {
        Self {
            by_hostname: HashMap::new(),
            by_hostname_regexp: Vec::new(),
            by_path_prefix: Vec::new(),
            apps: Vec::new(),
            timestamp,
        }
    }

    /// Transform app configs into concrete handler mounts.
    ///
    /// Any app failing handler materialization fails the whole build; the
    /// caller keeps serving from the previous snapshot.
    pub fn build(
        apps: Vec<Application>,
        factory: &mut BackendFactory,
        timestamp: SystemTime,
    ) -> Result<Self> {
        let mut table = Self::empty(timestamp);

        for app in &apps {
            let backend = factory
                .make_backend(&app.id, &app.backend)
                .map_err(|e| EdgeError::Config(format!("make_backend: {}: {}", app.id, e)))?;

            for frontend in &app.frontends {
                let mount = Mount {
                    prefix: frontend.path_prefix.clone(),
                    strip_prefix: frontend.strip_path_prefix,
                    allow_insecure_http: frontend.allow_insecure_http,
                    app: app.clone(),
                    backend: backend.clone(),
                };

                match frontend.kind {
                    FrontendKind::Hostname => {
                        let list = table
                            .by_hostname
                            .entry(frontend.hostname.clone())
                            .or_default();
                        list.push(mount);
                        sort_longest_prefix_first(list);
                    }
                    FrontendKind::HostnameRegexp => {
                        let regexp = host_pattern::compile(&frontend.hostname_regexp)?;
                        table.by_hostname_regexp.push(HostnameRegexpMounts {
                            regexp,
                            mounts: vec![mount],
                        });
                    }
                    FrontendKind::PathPrefix => {
                        table.by_path_prefix.push(mount);
                        sort_longest_prefix_first(&mut table.by_path_prefix);
                    }
                }
            }
        }

        table.apps = apps;
        Ok(table)
    }

    /// Resolve a request to a mount. `None` becomes a 404 at the pipeline
    /// level — resolution itself cannot fail.
    pub fn resolve(&self, hostname: &str, path: &str) -> Option<&Mount> {
        // hostname-independent path-based mounts win over everything
        if let Some(mount) = self.by_path_prefix.iter().find(|m| path_matches(m, path)) {
            return Some(mount);
        }

        // exact hostname will probably be the most common case
        if let Some(mounts) = self.by_hostname.get(hostname) {
            if let Some(mount) = mounts.iter().find(|m| path_matches(m, path)) {
                return Some(mount);
            }
            // no path match under the exact hostname; a regexp mount may
            // still cover this request
        }

        // regexp-based hostnames, in insertion order
        for entry in &self.by_hostname_regexp {
            if !entry.regexp.is_match(hostname) {
                continue;
            }
            if let Some(mount) = entry.mounts.iter().find(|m| path_matches(m, path)) {
                return Some(mount);
            }
        }

        None
    }

    pub fn apps(&self) -> &[Application] {
        &self.apps
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

/// Stable sort, so equal-length prefixes keep "first declared wins"
fn sort_longest_prefix_first(list: &mut MountList) {
    list.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
}

/// Prefix `/foo` matches `/foo` and `/foo/...` but not `/foobar`.
/// Trailing slashes on the prefix are normalized away; `/` matches all.
fn path_matches(mount: &Mount, path: &str) -> bool {
    if mount.prefix == "/" {
        return true;
    }

    let prefix = mount.prefix.trim_end_matches('/');

    path == prefix || path.starts_with(&format!("{}/", prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::factory_for_tests;
    use crate::config::{Application, Backend, Frontend};

    fn redirect_app(id: &str, frontend: Frontend) -> Application {
        Application::simple(id, frontend, Backend::redirect("https://elsewhere.example/"))
    }

    fn table_of(apps: Vec<Application>) -> RoutingTable {
        let mut factory = factory_for_tests();
        RoutingTable::build(apps, &mut factory, SystemTime::now()).unwrap()
    }

    fn resolved_app<'a>(table: &'a RoutingTable, hostname: &str, path: &str) -> Option<&'a str> {
        table.resolve(hostname, path).map(|m| m.app.id.as_str())
    }

    // --- Longest-prefix matching ---

    #[test]
    fn test_longest_prefix_match() {
        let table = table_of(vec![
            redirect_app("a", Frontend::hostname("example.com")),
            redirect_app("b", Frontend::hostname("docs.example.com")),
            redirect_app("c", Frontend::hostname("docs.example.com").with_path_prefix("/foo")),
            redirect_app("d", Frontend::hostname("docs.example.com").with_path_prefix("/bar")),
        ]);

        assert_eq!(resolved_app(&table, "example.com", "/"), Some("a"));
        assert_eq!(resolved_app(&table, "example.com", "/x"), Some("a"));
        assert_eq!(resolved_app(&table, "docs.example.com", "/"), Some("b"));
        assert_eq!(resolved_app(&table, "docs.example.com", "/foo"), Some("c"));
        assert_eq!(resolved_app(&table, "docs.example.com", "/foo/"), Some("c"));
        assert_eq!(resolved_app(&table, "docs.example.com", "/foo/x"), Some("c"));
        assert_eq!(resolved_app(&table, "docs.example.com", "/foobar"), Some("b"));
        assert_eq!(resolved_app(&table, "docs.example.com", "/bar"), Some("d"));
        assert_eq!(resolved_app(&table, "notfound.net", "/"), None);
    }

    #[test]
    fn test_global_path_prefix_wins_over_hostname() {
        let table = table_of(vec![
            redirect_app("b", Frontend::hostname("docs.example.com")),
            redirect_app(
                "e",
                Frontend::path_prefix("/.well-known/acme-challenge/"),
            ),
        ]);

        assert_eq!(
            resolved_app(&table, "docs.example.com", "/.well-known/acme-challenge/tok"),
            Some("e")
        );
        assert_eq!(
            resolved_app(&table, "docs.example.com", "/.well-known/other"),
            Some("b")
        );
    }

    #[test]
    fn test_trailing_slash_prefix_normalized() {
        let table = table_of(vec![redirect_app(
            "files",
            Frontend::hostname("example.com").with_path_prefix("/files/"),
        )]);

        assert_eq!(resolved_app(&table, "example.com", "/files"), Some("files"));
        assert_eq!(resolved_app(&table, "example.com", "/files/a.txt"), Some("files"));
        assert_eq!(resolved_app(&table, "example.com", "/filesystem"), None);
    }

    #[test]
    fn test_hostname_regexp_frontend() {
        let table = table_of(vec![
            redirect_app("wildcard", Frontend::hostname_regexp("app.{[^.]+}.example.com")),
            redirect_app("exact", Frontend::hostname("app.prod.example.com")),
        ]);

        // exact hostname ranks above regexp
        assert_eq!(resolved_app(&table, "app.prod.example.com", "/"), Some("exact"));
        assert_eq!(resolved_app(&table, "app.staging.example.com", "/"), Some("wildcard"));
        assert_eq!(resolved_app(&table, "other.example.com", "/"), None);
    }

    #[test]
    fn test_exact_hostname_path_miss_falls_through_to_regexp() {
        let table = table_of(vec![
            redirect_app(
                "exact-v2",
                Frontend::hostname("api.example.com").with_path_prefix("/v2"),
            ),
            redirect_app("wildcard", Frontend::hostname_regexp("{.+}.example.com")),
        ]);

        // the exact hostname wins where its prefix matches
        assert_eq!(resolved_app(&table, "api.example.com", "/v2/users"), Some("exact-v2"));

        // but a path miss under the exact hostname is not a dead end:
        // the regexp mounts still get their turn
        assert_eq!(resolved_app(&table, "api.example.com", "/health"), Some("wildcard"));
    }

    #[test]
    fn test_regexp_insertion_order_preserved() {
        let table = table_of(vec![
            redirect_app("first", Frontend::hostname_regexp("{.+}.example.com")),
            redirect_app("second", Frontend::hostname_regexp("api.{[^.]+}.example.com")),
        ]);

        // both regexps match; first inserted wins
        assert_eq!(resolved_app(&table, "api.prod.example.com", "/"), Some("first"));
    }

    #[test]
    fn test_equal_length_prefixes_first_declared_wins() {
        let table = table_of(vec![
            redirect_app("first", Frontend::hostname("example.com").with_path_prefix("/aaa")),
            redirect_app("second", Frontend::hostname("example.com").with_path_prefix("/bbb")),
        ]);

        // sorting is stable: equal-length collisions keep declaration order
        assert_eq!(resolved_app(&table, "example.com", "/aaa"), Some("first"));
        assert_eq!(resolved_app(&table, "example.com", "/bbb"), Some("second"));
    }

    #[test]
    fn test_multiple_frontends_share_one_handler() {
        let app = Application {
            id: "multi".to_string(),
            frontends: vec![
                Frontend::hostname("a.example.com"),
                Frontend::hostname("b.example.com"),
            ],
            backend: Backend::redirect("https://elsewhere.example/"),
        };

        let table = table_of(vec![app]);

        let a = table.resolve("a.example.com", "/").unwrap();
        let b = table.resolve("b.example.com", "/").unwrap();
        assert!(Arc::ptr_eq(&a.backend, &b.backend));
    }

    #[test]
    fn test_root_prefix_always_matches() {
        let table = table_of(vec![redirect_app("root", Frontend::hostname("example.com"))]);

        for path in ["/", "/a", "/a/b/c", "/favicon.ico"] {
            assert_eq!(resolved_app(&table, "example.com", path), Some("root"), "{}", path);
        }
    }

    #[test]
    fn test_build_deterministic() {
        let apps = vec![
            redirect_app("root", Frontend::hostname("example.com")),
            redirect_app("deep", Frontend::hostname("example.com").with_path_prefix("/a/b/c")),
            redirect_app("mid", Frontend::hostname("example.com").with_path_prefix("/a")),
        ];

        for _ in 0..3 {
            let table = table_of(apps.clone());
            assert_eq!(resolved_app(&table, "example.com", "/a/b/c/d"), Some("deep"));
            assert_eq!(resolved_app(&table, "example.com", "/a/x"), Some("mid"));
            assert_eq!(resolved_app(&table, "example.com", "/z"), Some("root"));
        }
    }

    #[test]
    fn test_build_failure_aborts_whole_table() {
        let mut bad = redirect_app("bad", Frontend::hostname("bad.example.com"));
        bad.backend.redirect_opts = None; // unbuildable

        let apps = vec![redirect_app("good", Frontend::hostname("good.example.com")), bad];

        let mut factory = factory_for_tests();
        let result = RoutingTable::build(apps, &mut factory, SystemTime::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_table() {
        let table = RoutingTable::empty(SystemTime::UNIX_EPOCH);
        assert!(table.resolve("example.com", "/").is_none());
        assert!(table.apps().is_empty());
    }
}
