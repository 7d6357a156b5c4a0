use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use url::{Host, Url};

use crate::crd::{
    DeploymentStrategy, GcsSource, GitSource, ImageSource, InlineSource, Language,
    LambdaFunctionSpec, MinioSource, S3Source, Source,
};

pub const MAX_HANDLER_LEN: usize = 100;
pub const MAX_GIT_URL_LEN: usize = 2048;
pub const MAX_GIT_REF_LEN: usize = 256;
pub const MAX_GIT_PATH_LEN: usize = 512;
pub const MAX_OBJECT_KEY_LEN: usize = 1024;
pub const MAX_ENDPOINT_LEN: usize = 253;
/// ConfigMaps cap out at 1MiB; leave room for the generated files.
pub const MAX_INLINE_CODE_BYTES: usize = 512 * 1024;

/// Hosts that must never be a fetch target, matched exactly or as a domain suffix.
pub const BLOCKED_HOSTS: &[&str] = &[
    "169.254.169.254",
    "169.254.170.2",
    "metadata.google.internal",
    "metadata.goog",
    "kubernetes",
    "kubernetes.default",
    "kubernetes.default.svc",
    "localhost",
    "127.0.0.1",
    "0.0.0.0",
    "::1",
    "10.96.0.1",
];

const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '$', '`', '(', ')', '{', '}', '[', ']', '<', '>', '!', '#', '*', '?', '~',
    '\\', '\n', '\r', '\'', '"',
];

static HANDLER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*\.[a-zA-Z_][a-zA-Z0-9_]*$").expect("valid regex")
});
static GIT_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._/-]*$").expect("valid regex"));
static GIT_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._/-]+$").expect("valid regex"));
static BUCKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").expect("valid regex"));
static GCS_BUCKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{1,61}[a-z0-9]$").expect("valid regex"));
static OBJECT_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9!_.*'()/-]+$").expect("valid regex"));
static ENDPOINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][-a-zA-Z0-9.]*[a-zA-Z0-9](:[0-9]{1,5})?$").expect("valid regex")
});
static S3_REGION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2}-[a-z]+-[0-9]+$").expect("valid regex"));
static GCS_PROJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]{4,28}[a-z0-9]$").expect("valid regex"));
static IMAGE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("valid regex"));
static RUNTIME_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("valid regex"));
static DIGEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[+._-][a-z0-9]+)*:[a-fA-F0-9]{32,}$").expect("valid regex")
});

/// A rejected function spec. `message` is what ends up on the SourceReady condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// One failed security rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct Violation {
    pub field: &'static str,
    pub message: String,
}

impl Violation {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }

    fn within(self, context: &str) -> ValidationError {
        ValidationError::new(self.field, format!("{context}: {self}"))
    }
}

/// Checks a function spec for completeness and rejects inputs that could
/// reach internal endpoints or be interpreted by a shell downstream.
pub fn validate(spec: &LambdaFunctionSpec, strategy: DeploymentStrategy) -> Result<(), ValidationError> {
    let source = spec
        .source
        .resolve()
        .map_err(|e| ValidationError::new("source.type", e.to_string()))?;

    match source {
        Source::Minio(minio) => {
            if minio.bucket.is_empty() || minio.key.is_empty() {
                return Err(ValidationError::new("source.minio", "minio bucket and key are required"));
            }
            check_minio(minio).map_err(|v| v.within("minio source validation failed"))?;
        }
        Source::S3(s3) => {
            if s3.bucket.is_empty() || s3.key.is_empty() {
                return Err(ValidationError::new("source.s3", "s3 bucket and key are required"));
            }
            check_s3(s3).map_err(|v| v.within("s3 source validation failed"))?;
        }
        Source::Gcs(gcs) => {
            if gcs.bucket.is_empty() || gcs.key.is_empty() {
                return Err(ValidationError::new("source.gcs", "gcs bucket and key are required"));
            }
            check_gcs(gcs).map_err(|v| v.within("gcs source validation failed"))?;
        }
        Source::Git(git) => {
            if git.url.is_empty() {
                return Err(ValidationError::new("source.git.url", "git url is required"));
            }
            check_git(git).map_err(|v| v.within("git source validation failed"))?;
        }
        Source::Inline(inline) => {
            if inline.code.trim().is_empty() {
                return Err(ValidationError::new("source.inline.code", "inline code is required"));
            }
            check_inline(inline).map_err(|v| v.within("inline source validation failed"))?;
        }
        Source::Image(image) => {
            if image.repository.is_empty() {
                return Err(ValidationError::new(
                    "source.image.repository",
                    "image repository is required",
                ));
            }
            check_image(image).map_err(|v| v.within("image source validation failed"))?;
        }
    }

    if strategy == DeploymentStrategy::PrebuiltImage && !matches!(source, Source::Image(_)) {
        return Err(ValidationError::new(
            "spec.strategy",
            "image strategy requires source type 'image'",
        ));
    }

    if strategy == DeploymentStrategy::Build && matches!(source, Source::Image(_)) {
        return Err(ValidationError::new(
            "spec.strategy",
            "build strategy cannot use source type 'image'",
        ));
    }

    if let Some(build) = spec.build.as_ref() {
        for (field, value) in [
            ("build.registry", build.registry.as_deref()),
            ("build.repository", build.repository.as_deref()),
        ] {
            if let Some(value) = value {
                check_image_name(field, value).map_err(|v| v.within("build validation failed"))?;
            }
        }
    }

    if spec.runtime.language.trim().is_empty() {
        return Err(ValidationError::new("runtime.language", "runtime language is required"));
    }
    if spec.runtime.version.trim().is_empty() {
        return Err(ValidationError::new("runtime.version", "runtime version is required"));
    }
    if strategy == DeploymentStrategy::Build {
        if Language::parse(&spec.runtime.language).is_none() {
            return Err(ValidationError::new(
                "runtime.language",
                format!("unsupported runtime language: {}", spec.runtime.language),
            ));
        }
        // The version is interpolated into the base image reference.
        if !RUNTIME_VERSION_RE.is_match(spec.runtime.version.trim()) {
            return Err(Violation::new("runtime.version", "contains invalid characters")
                .within("runtime validation failed"));
        }
    }

    if let Some(handler) = spec.runtime.handler.as_deref() {
        check_handler(handler).map_err(|v| v.within("handler validation failed"))?;
    }

    Ok(())
}

/// Empty means "use the default handler".
pub fn check_handler(handler: &str) -> Result<(), Violation> {
    if handler.is_empty() {
        return Ok(());
    }
    if handler.len() > MAX_HANDLER_LEN {
        return Err(Violation::new(
            "runtime.handler",
            format!("must be at most {MAX_HANDLER_LEN} characters"),
        ));
    }
    reject_shell_metacharacters("runtime.handler", handler)?;
    if !HANDLER_RE.is_match(handler) {
        return Err(Violation::new(
            "runtime.handler",
            "must have the form module.function using letters, digits and underscores",
        ));
    }
    Ok(())
}

fn check_git(git: &GitSource) -> Result<(), Violation> {
    check_git_url(&git.url)?;

    if let Some(git_ref) = git.git_ref.as_deref().filter(|r| !r.is_empty()) {
        if git_ref.len() > MAX_GIT_REF_LEN {
            return Err(Violation::new("git.ref", format!("must be at most {MAX_GIT_REF_LEN} characters")));
        }
        if git_ref.contains("..") {
            return Err(Violation::new("git.ref", "must not contain '..'"));
        }
        if !GIT_REF_RE.is_match(git_ref) {
            return Err(Violation::new("git.ref", "contains invalid characters"));
        }
    }

    if let Some(path) = git.path.as_deref().filter(|p| !p.is_empty()) {
        check_relative_path("git.path", path, MAX_GIT_PATH_LEN)?;
    }

    Ok(())
}

pub fn check_git_url(raw: &str) -> Result<(), Violation> {
    const FIELD: &str = "git.url";

    if raw.len() > MAX_GIT_URL_LEN {
        return Err(Violation::new(FIELD, format!("must be at most {MAX_GIT_URL_LEN} characters")));
    }
    if raw.chars().any(|c| c.is_whitespace() || matches!(c, ';' | '|' | '$' | '`' | '\'' | '"' | '\\')) {
        return Err(Violation::new(FIELD, "contains forbidden characters"));
    }

    let url = Url::parse(raw).map_err(|e| Violation::new(FIELD, format!("invalid URL: {e}")))?;
    let host = url
        .host()
        .ok_or_else(|| Violation::new(FIELD, "URL must include a host"))?;

    match url.scheme() {
        "https" | "git" | "ssh" => {}
        "http" => {
            let in_cluster = matches!(&host, Host::Domain(d) if is_cluster_local(d));
            if !in_cluster {
                return Err(Violation::new(
                    FIELD,
                    "http is only allowed for in-cluster services (*.svc, *.svc.cluster.local)",
                ));
            }
        }
        other => return Err(Violation::new(FIELD, format!("scheme '{other}' is not allowed"))),
    }

    check_host(FIELD, &host, true)
}

fn check_minio(minio: &MinioSource) -> Result<(), Violation> {
    if let Some(endpoint) = minio.endpoint.as_deref().filter(|e| !e.is_empty()) {
        check_endpoint(endpoint)?;
    }
    check_bucket("minio.bucket", &minio.bucket, &BUCKET_RE)?;
    check_object_key("minio.key", &minio.key)
}

fn check_s3(s3: &S3Source) -> Result<(), Violation> {
    check_bucket("s3.bucket", &s3.bucket, &BUCKET_RE)?;
    check_object_key("s3.key", &s3.key)?;
    if let Some(region) = s3.region.as_deref().filter(|r| !r.is_empty()) {
        if !S3_REGION_RE.is_match(region) {
            return Err(Violation::new("s3.region", "must look like us-east-1"));
        }
    }
    Ok(())
}

fn check_gcs(gcs: &GcsSource) -> Result<(), Violation> {
    check_bucket("gcs.bucket", &gcs.bucket, &GCS_BUCKET_RE)?;
    if gcs.bucket.starts_with("goog") || gcs.bucket.contains("google") {
        return Err(Violation::new("gcs.bucket", "must not start with 'goog' or contain 'google'"));
    }
    check_object_key("gcs.key", &gcs.key)?;
    if let Some(project) = gcs.project.as_deref().filter(|p| !p.is_empty()) {
        if !GCS_PROJECT_RE.is_match(project) {
            return Err(Violation::new("gcs.project", "is not a valid project id"));
        }
    }
    Ok(())
}

fn check_inline(inline: &InlineSource) -> Result<(), Violation> {
    if inline.code.len() > MAX_INLINE_CODE_BYTES {
        return Err(Violation::new(
            "inline.code",
            format!("must be at most {MAX_INLINE_CODE_BYTES} bytes"),
        ));
    }
    Ok(())
}

fn check_image_name(field: &'static str, value: &str) -> Result<(), Violation> {
    if value.chars().any(char::is_whitespace) {
        return Err(Violation::new(field, "must not contain whitespace"));
    }
    reject_shell_metacharacters(field, value)
}

fn check_image(image: &ImageSource) -> Result<(), Violation> {
    check_image_name("image.repository", &image.repository)?;

    if let Some(tag) = image.tag.as_deref().filter(|t| !t.is_empty()) {
        if !IMAGE_TAG_RE.is_match(tag) {
            return Err(Violation::new("image.tag", "is not a valid image tag"));
        }
    }
    if let Some(digest) = image.digest.as_deref().filter(|d| !d.is_empty()) {
        if !DIGEST_RE.is_match(digest) {
            return Err(Violation::new("image.digest", "must have the form algorithm:hex"));
        }
    }
    if let Some(port) = image.port {
        if !(1..=65535).contains(&port) {
            return Err(Violation::new("image.port", "must be between 1 and 65535"));
        }
    }
    Ok(())
}

fn check_bucket(field: &'static str, bucket: &str, pattern: &Regex) -> Result<(), Violation> {
    if !pattern.is_match(bucket) {
        return Err(Violation::new(field, "is not a valid bucket name"));
    }
    if bucket.contains("..") {
        return Err(Violation::new(field, "must not contain '..'"));
    }
    Ok(())
}

fn check_object_key(field: &'static str, key: &str) -> Result<(), Violation> {
    if key.len() > MAX_OBJECT_KEY_LEN {
        return Err(Violation::new(field, format!("must be at most {MAX_OBJECT_KEY_LEN} characters")));
    }
    if key.contains("..") {
        return Err(Violation::new(field, "must not contain '..'"));
    }
    reject_shell_metacharacters(field, key)?;
    if !OBJECT_KEY_RE.is_match(key) {
        return Err(Violation::new(field, "contains invalid characters"));
    }
    Ok(())
}

fn check_endpoint(endpoint: &str) -> Result<(), Violation> {
    const FIELD: &str = "minio.endpoint";

    if endpoint.len() > MAX_ENDPOINT_LEN {
        return Err(Violation::new(FIELD, format!("must be at most {MAX_ENDPOINT_LEN} characters")));
    }
    if !ENDPOINT_RE.is_match(endpoint) {
        return Err(Violation::new(FIELD, "must be host or host:port without a scheme"));
    }
    let host = endpoint.split(':').next().unwrap_or(endpoint);
    let host = Host::parse(host).map_err(|e| Violation::new(FIELD, format!("invalid host: {e}")))?;
    check_host(FIELD, &host, false)
}

fn check_relative_path(field: &'static str, path: &str, max: usize) -> Result<(), Violation> {
    if path.len() > max {
        return Err(Violation::new(field, format!("must be at most {max} characters")));
    }
    if path.starts_with('/') {
        return Err(Violation::new(field, "must be relative"));
    }
    if path.contains("..") {
        return Err(Violation::new(field, "must not contain '..'"));
    }
    if !GIT_PATH_RE.is_match(path) {
        return Err(Violation::new(field, "contains invalid characters"));
    }
    Ok(())
}

fn reject_shell_metacharacters(field: &'static str, value: &str) -> Result<(), Violation> {
    match value.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        Some(c) => Err(Violation::new(field, format!("contains forbidden character {c:?}"))),
        None => Ok(()),
    }
}

/// Private address ranges are only rejected for remote fetch targets; object
/// store endpoints commonly live on cluster IPs.
fn check_host<S: AsRef<str>>(
    field: &'static str,
    host: &Host<S>,
    block_private: bool,
) -> Result<(), Violation> {
    let blocked = || Violation::new(field, "host is not allowed");

    let ip = match host {
        Host::Domain(domain) => {
            let domain = domain.as_ref().trim_end_matches('.').to_ascii_lowercase();
            if is_blocked_name(&domain) {
                return Err(blocked());
            }
            domain
                .parse::<IpAddr>()
                .ok()
                .or_else(|| inet_aton(&domain).map(IpAddr::V4))
        }
        Host::Ipv4(v4) => Some(IpAddr::V4(*v4)),
        Host::Ipv6(v6) => Some(IpAddr::V6(*v6)),
    };

    match ip {
        Some(ip) if is_blocked_name(&ip.to_string()) => Err(blocked()),
        Some(ip) if is_metadata_range(&ip) => Err(blocked()),
        Some(ip) if block_private && is_blocked_ip(&ip) => Err(blocked()),
        _ => Ok(()),
    }
}

/// Parses the shorthand IPv4 forms resolvers still accept for hosts of
/// non-special schemes (`git://`, `ssh://`): one to four parts, each decimal,
/// octal (`0` prefix) or hex (`0x` prefix), the last part filling the
/// remaining bytes. `10.1` is `10.0.0.1` and `2130706433` is `127.0.0.1`.
fn inet_aton(host: &str) -> Option<Ipv4Addr> {
    let parts = host
        .split('.')
        .map(inet_part)
        .collect::<Option<Vec<u32>>>()?;
    let (last, head) = parts.split_last()?;
    if head.len() > 3 || head.iter().any(|p| *p > 0xff) {
        return None;
    }
    let width = 8 * (4 - head.len() as u32);
    if width < 32 && last >> width != 0 {
        return None;
    }
    let addr = head
        .iter()
        .enumerate()
        .fold(*last, |acc, (i, p)| acc | p << (24 - 8 * i as u32));
    Some(Ipv4Addr::from(addr))
}

fn inet_part(part: &str) -> Option<u32> {
    let (digits, radix) = if let Some(hex) = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")) {
        (hex, 16)
    } else if part.len() > 1 && part.starts_with('0') {
        (&part[1..], 8)
    } else {
        (part, 10)
    };
    if digits.is_empty() {
        return (radix == 16).then_some(0);
    }
    if !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u32::from_str_radix(digits, radix).ok()
}

fn is_blocked_name(host: &str) -> bool {
    BLOCKED_HOSTS
        .iter()
        .any(|b| host == *b || host.ends_with(&format!(".{b}")))
}

fn is_cluster_local(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.');
    domain.ends_with(".svc") || domain.ends_with(".svc.cluster.local")
}

fn is_metadata_range(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some_and(|v4| v4.is_link_local()),
    }
}

pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || a == 0
        || (a == 100 && (64..=127).contains(&b))
}

fn is_blocked_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_v4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}
