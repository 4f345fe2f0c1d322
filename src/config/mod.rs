//! Application configuration model — apps, frontends, backends
//!
//! The unit of configuration is an [`Application`]: one or more user-facing
//! match rules ([`Frontend`]) bound to exactly one [`Backend`]. Applications
//! arrive from discovery as JSON and are validated before a routing table is
//! built from them.

use crate::error::{EdgeError, Result};
use crate::turbocharger::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Read access to the configuration the router knows *right now*,
/// aggregated over every discovery mechanism in use.
pub trait ConfigAccessor: Send + Sync {
    /// Applications in the currently published snapshot
    fn apps(&self) -> Vec<Application>;
    /// When the snapshot was built (sentinel year-2000 if never)
    fn last_updated(&self) -> SystemTime;
}

/// An application: stable id, match rules, one backend.
///
/// The id is referenced by IP access-control rules and used as a cache
/// namespace, so it must stay stable across restarts and replica changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub frontends: Vec<Frontend>,
    pub backend: Backend,
}

/// Frontend match rule kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontendKind {
    /// Exact hostname equality
    Hostname,
    /// Hostname pattern with `{regex}` placeholders
    HostnameRegexp,
    /// Path prefix on any hostname (e.g. ACME challenges)
    PathPrefix,
}

/// A user-facing match rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frontend {
    pub kind: FrontendKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname_regexp: String,
    /// Applies with every kind; `/` matches everything
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub strip_path_prefix: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_insecure_http: bool,
}

fn default_path_prefix() -> String {
    "/".to_string()
}

fn is_false(b: &bool) -> bool {
    !b
}

impl Frontend {
    /// Frontend matching one exact hostname at `/`
    pub fn hostname(hostname: impl Into<String>) -> Self {
        Self {
            kind: FrontendKind::Hostname,
            hostname: hostname.into(),
            hostname_regexp: String::new(),
            path_prefix: default_path_prefix(),
            strip_path_prefix: false,
            allow_insecure_http: false,
        }
    }

    /// Frontend matching a hostname pattern like `app.{[^.]+}.example.com`
    pub fn hostname_regexp(pattern: impl Into<String>) -> Self {
        Self {
            kind: FrontendKind::HostnameRegexp,
            hostname: String::new(),
            hostname_regexp: pattern.into(),
            path_prefix: default_path_prefix(),
            strip_path_prefix: false,
            allow_insecure_http: false,
        }
    }

    /// Frontend catching a path prefix on all hostnames
    pub fn path_prefix(prefix: impl Into<String>) -> Self {
        Self {
            kind: FrontendKind::PathPrefix,
            hostname: String::new(),
            hostname_regexp: String::new(),
            path_prefix: prefix.into(),
            strip_path_prefix: false,
            allow_insecure_http: false,
        }
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into();
        self
    }

    pub fn with_strip_path_prefix(mut self) -> Self {
        self.strip_path_prefix = true;
        self
    }

    pub fn with_allow_insecure_http(mut self) -> Self {
        self.allow_insecure_http = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        match self.kind {
            FrontendKind::Hostname => error_if_unset(self.hostname.is_empty(), "hostname"),
            FrontendKind::HostnameRegexp => {
                error_if_unset(self.hostname_regexp.is_empty(), "hostname_regexp")?;
                crate::routing::host_pattern::compile(&self.hostname_regexp)
                    .map(|_| ())
                    .map_err(|e| EdgeError::Validation(format!("hostname_regexp: {}", e)))
            }
            FrontendKind::PathPrefix => error_if_unset(self.path_prefix.is_empty(), "path_prefix"),
        }
    }

    /// One-line description for the admin UI
    pub fn describe(&self) -> String {
        match self.kind {
            FrontendKind::Hostname => format!("hostname:{}{}", self.hostname, self.path_prefix),
            FrontendKind::HostnameRegexp => {
                format!("hostname_regexp:{}{}", self.hostname_regexp, self.path_prefix)
            }
            FrontendKind::PathPrefix => format!("path_prefix:{}", self.path_prefix),
        }
    }
}

/// Backend handler kind
///
/// When adding a kind, remember to update `Application::validate()`,
/// `Backend::describe()` and the factory in `backend/mod.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    ReverseProxy,
    /// Deprecated — delegates to ReverseProxy with caching + index document
    S3StaticWebsite,
    AwsLambda,
    EdgerouterAdmin,
    AuthV0,
    AuthSso,
    Redirect,
    PromMetrics,
    Turbocharger,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::ReverseProxy => "reverse_proxy",
            BackendKind::S3StaticWebsite => "s3_static_website",
            BackendKind::AwsLambda => "aws_lambda",
            BackendKind::EdgerouterAdmin => "edgerouter_admin",
            BackendKind::AuthV0 => "auth_v0",
            BackendKind::AuthSso => "auth_sso",
            BackendKind::Redirect => "redirect",
            BackendKind::PromMetrics => "prom_metrics",
            BackendKind::Turbocharger => "turbocharger",
        };
        write!(f, "{}", s)
    }
}

/// A backend: tagged by kind, with the matching options payload set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub kind: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_static_website_opts: Option<BackendOptsS3StaticWebsite>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_proxy_opts: Option<BackendOptsReverseProxy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_lambda_opts: Option<BackendOptsAwsLambda>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_v0_opts: Option<BackendOptsAuthV0>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_sso_opts: Option<BackendOptsAuthSso>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_opts: Option<BackendOptsRedirect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turbocharger_opts: Option<BackendOptsTurbocharger>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOptsS3StaticWebsite {
    pub bucket_name: String,
    pub region_id: String,
    /// Can be empty before the first deployed version
    #[serde(default)]
    pub deployed_version: String,
    /// Optional, e.g. "404.html", relative to the root of the deployed site
    #[serde(rename = "404_page", default, skip_serializing_if = "String::is_empty")]
    pub not_found_page: String,
}

impl BackendOptsS3StaticWebsite {
    pub fn validate(&self) -> Result<()> {
        error_if_unset(self.bucket_name.is_empty(), "bucket_name")?;
        error_if_unset(self.region_id.is_empty(), "region_id")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOptsReverseProxy {
    pub origins: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<TlsConfig>,
    /// Turn on response caching?
    #[serde(default, skip_serializing_if = "is_false")]
    pub caching: bool,
    /// Use client-sent Host (=true) or origin's hostname (=false)
    #[serde(default, skip_serializing_if = "is_false")]
    pub pass_host_header: bool,
    /// If request path ends in `/foo/` ("directory"), rewrite it into `/foo/<index_document>`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub index_document: String,
    /// Reduces cache misses if responses don't vary on the query string
    #[serde(default, skip_serializing_if = "is_false")]
    pub remove_query_string: bool,
    /// Force-add headers to be sent to origin.
    /// Ordered map: the backend fingerprint is its JSON serialization, which
    /// must not vary between rebuilds of the same config.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers_to_origin: BTreeMap<String, String>,
}

impl BackendOptsReverseProxy {
    pub fn validate(&self) -> Result<()> {
        error_if_unset(self.origins.is_empty(), "origins")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOptsAwsLambda {
    pub function_name: String,
    pub region_id: String,
}

impl BackendOptsAwsLambda {
    pub fn validate(&self) -> Result<()> {
        error_if_unset(self.function_name.is_empty(), "function_name")?;
        error_if_unset(self.region_id.is_empty(), "region_id")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOptsAuthV0 {
    pub bearer_token: String,
    pub authorized_backend: Box<Backend>,
}

impl BackendOptsAuthV0 {
    pub fn validate(&self) -> Result<()> {
        error_if_unset(self.bearer_token.is_empty(), "bearer_token")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOptsAuthSso {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id_server_url: String,
    pub allowed_user_ids: Vec<String>,
    pub audience: String,
    pub authorized_backend: Box<Backend>,
}

impl BackendOptsAuthSso {
    pub fn validate(&self) -> Result<()> {
        error_if_unset(self.audience.is_empty(), "audience")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOptsRedirect {
    pub to: String,
}

impl BackendOptsRedirect {
    pub fn validate(&self) -> Result<()> {
        error_if_unset(self.to.is_empty(), "to")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOptsTurbocharger {
    pub manifest: ObjectId,
}

/// Outbound TLS overrides for a reverse-proxy backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure_skip_verify: bool,
    /// Used to verify the hostname on the origin's cert; also sent via SNI
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_name: String,
}

impl TlsConfig {
    pub fn has_meaningful_content(&self) -> bool {
        self.insecure_skip_verify || !self.server_name.is_empty()
    }
}

impl Application {
    pub fn simple(id: impl Into<String>, frontend: Frontend, backend: Backend) -> Self {
        Self {
            id: id.into(),
            frontends: vec![frontend],
            backend,
        }
    }

    pub fn validate(&self) -> Result<()> {
        error_if_unset(self.id.is_empty(), "id")?;
        error_if_unset(self.frontends.is_empty(), "frontends")?;

        for frontend in &self.frontends {
            frontend
                .validate()
                .map_err(|e| EdgeError::Validation(format!("app {} frontend: {}", self.id, e)))?;
        }

        self.backend
            .validate()
            .map_err(|e| EdgeError::Validation(format!("app {} backend: {}", self.id, e)))
    }

    /// Multi-line description for the admin UI
    pub fn describe(&self) -> String {
        let mut lines = vec![self.id.clone(), format!("  backend = {}", self.backend.describe())];
        for frontend in &self.frontends {
            lines.push(format!("  frontend = {}", frontend.describe()));
        }
        lines.join("\n")
    }
}

impl Backend {
    pub fn reverse_proxy(origins: Vec<String>) -> Self {
        Self::of_kind(BackendKind::ReverseProxy).with(|b| {
            b.reverse_proxy_opts = Some(BackendOptsReverseProxy {
                origins,
                tls_config: None,
                caching: false,
                pass_host_header: false,
                index_document: String::new(),
                remove_query_string: false,
                headers_to_origin: BTreeMap::new(),
            })
        })
    }

    pub fn redirect(to: impl Into<String>) -> Self {
        Self::of_kind(BackendKind::Redirect).with(|b| {
            b.redirect_opts = Some(BackendOptsRedirect { to: to.into() });
        })
    }

    pub fn auth_v0(bearer_token: impl Into<String>, authorized: Backend) -> Self {
        Self::of_kind(BackendKind::AuthV0).with(|b| {
            b.auth_v0_opts = Some(BackendOptsAuthV0 {
                bearer_token: bearer_token.into(),
                authorized_backend: Box::new(authorized),
            });
        })
    }

    pub fn turbocharger(manifest: ObjectId) -> Self {
        Self::of_kind(BackendKind::Turbocharger).with(|b| {
            b.turbocharger_opts = Some(BackendOptsTurbocharger { manifest });
        })
    }

    pub fn admin() -> Self {
        Self::of_kind(BackendKind::EdgerouterAdmin)
    }

    pub fn prom_metrics() -> Self {
        Self::of_kind(BackendKind::PromMetrics)
    }

    fn of_kind(kind: BackendKind) -> Self {
        Self {
            kind,
            s3_static_website_opts: None,
            reverse_proxy_opts: None,
            aws_lambda_opts: None,
            auth_v0_opts: None,
            auth_sso_opts: None,
            redirect_opts: None,
            turbocharger_opts: None,
        }
    }

    fn with(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self
    }

    pub fn validate(&self) -> Result<()> {
        match self.kind {
            BackendKind::S3StaticWebsite => self.opts(&self.s3_static_website_opts)?.validate(),
            BackendKind::ReverseProxy => self.opts(&self.reverse_proxy_opts)?.validate(),
            BackendKind::AwsLambda => self.opts(&self.aws_lambda_opts)?.validate(),
            BackendKind::AuthV0 => {
                let opts = self.opts(&self.auth_v0_opts)?;
                opts.validate()?;
                opts.authorized_backend.validate()
            }
            BackendKind::AuthSso => {
                let opts = self.opts(&self.auth_sso_opts)?;
                opts.validate()?;
                opts.authorized_backend.validate()
            }
            BackendKind::Redirect => self.opts(&self.redirect_opts)?.validate(),
            BackendKind::Turbocharger => self.opts(&self.turbocharger_opts).map(|_| ()),
            BackendKind::EdgerouterAdmin | BackendKind::PromMetrics => Ok(()),
        }
    }

    fn opts<'a, T>(&self, opts: &'a Option<T>) -> Result<&'a T> {
        opts.as_ref().ok_or_else(|| {
            EdgeError::Validation(format!("backend kind {} is missing its options payload", self.kind))
        })
    }

    /// Deterministic fingerprint of this backend's configuration.
    /// Same config serializes to the same bytes, so handler instances can be
    /// reused across routing-table rebuilds.
    pub fn fingerprint(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// One-line description for the admin UI
    pub fn describe(&self) -> String {
        match self.kind {
            BackendKind::S3StaticWebsite => {
                let v = self
                    .s3_static_website_opts
                    .as_ref()
                    .map(|o| o.deployed_version.as_str())
                    .unwrap_or("");
                format!("{}:{}", self.kind, v)
            }
            BackendKind::ReverseProxy => {
                let origins = self
                    .reverse_proxy_opts
                    .as_ref()
                    .map(|o| o.origins.join(", "))
                    .unwrap_or_default();
                format!("{}:{}", self.kind, origins)
            }
            BackendKind::AwsLambda => {
                let detail = self
                    .aws_lambda_opts
                    .as_ref()
                    .map(|o| format!("{}@{}", o.function_name, o.region_id))
                    .unwrap_or_default();
                format!("{}:{}", self.kind, detail)
            }
            BackendKind::AuthV0 => {
                let inner = self
                    .auth_v0_opts
                    .as_ref()
                    .map(|o| o.authorized_backend.describe())
                    .unwrap_or_default();
                format!("{}:[bearer_token=...] -> {}", self.kind, inner)
            }
            BackendKind::AuthSso => {
                let detail = self
                    .auth_sso_opts
                    .as_ref()
                    .map(|o| format!("[audience={}] -> {}", o.audience, o.authorized_backend.describe()))
                    .unwrap_or_default();
                format!("{}:{}", self.kind, detail)
            }
            BackendKind::Redirect => {
                let to = self.redirect_opts.as_ref().map(|o| o.to.as_str()).unwrap_or("");
                format!("{}:{}", self.kind, to)
            }
            BackendKind::Turbocharger => {
                let m = self
                    .turbocharger_opts
                    .as_ref()
                    .map(|o| o.manifest.to_string())
                    .unwrap_or_default();
                format!("{}:{}", self.kind, m)
            }
            BackendKind::EdgerouterAdmin | BackendKind::PromMetrics => self.kind.to_string(),
        }
    }
}

/// Find an application by its stable id
pub fn find_application<'a>(id: &str, apps: &'a [Application]) -> Option<&'a Application> {
    apps.iter().find(|app| app.id == id)
}

fn error_if_unset(is_unset: bool, field_name: &str) -> Result<()> {
    if is_unset {
        Err(EdgeError::Validation(format!(
            "'{}' is required but not set",
            field_name
        )))
    } else {
        Ok(())
    }
}
