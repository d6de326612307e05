//! Path classification, joining and endpoint synthesis across `local`, `s3`,
//! `gs`, `http(s)` and `ftp` schemes, plus the Locator resolver and the
//! raw-SQL locator rewriter.

use std::path::PathBuf;

use regex::Regex;

use crate::error::{FlowError, Result};

/// A classified path. Remote variants split into `bucket` (netloc) and
/// `key` (path with the leading `/` stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Path {
    Local(String),
    S3 { bucket: String, key: String },
    Gs { bucket: String, key: String },
    Http { scheme: String, netloc: String, path: String },
    Ftp { bucket: String, key: String },
}

impl Path {
    /// Classifies a string by scheme prefix.
    pub fn parse(s: &str) -> Path {
        if let Some(rest) = s.strip_prefix("s3://") {
            let (bucket, key) = split_bucket_key(rest);
            Path::S3 { bucket, key }
        } else if let Some(rest) = s.strip_prefix("gs://") {
            let (bucket, key) = split_bucket_key(rest);
            Path::Gs { bucket, key }
        } else if let Some(rest) = s.strip_prefix("ftp://") {
            let (bucket, key) = split_bucket_key(rest);
            Path::Ftp { bucket, key }
        } else if s.starts_with("http://") || s.starts_with("https://") {
            let scheme = if s.starts_with("https://") { "https" } else { "http" }.to_string();
            let rest = s.splitn(2, "://").nth(1).unwrap_or("");
            let (netloc, path) = split_bucket_key(rest);
            Path::Http { scheme, netloc, path }
        } else if let Some(rest) = s.strip_prefix("file://") {
            Path::Local(rest.to_string())
        } else {
            Path::Local(s.to_string())
        }
    }

    pub fn is_glob(&self) -> bool {
        self.as_str().chars().any(|c| matches!(c, '*' | '?' | '[' | ']'))
    }

    pub fn is_absolute(&self) -> bool {
        let s = self.as_str();
        s.starts_with('/') || s.contains("://")
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Path::Local(_) => "file",
            Path::S3 { .. } => "s3",
            Path::Gs { .. } => "gs",
            Path::Http { scheme, .. } if scheme == "https" => "https",
            Path::Http { .. } => "http",
            Path::Ftp { .. } => "ftp",
        }
    }

    pub fn bucket(&self) -> Option<&str> {
        match self {
            Path::S3 { bucket, .. } | Path::Gs { bucket, .. } | Path::Ftp { bucket, .. } => {
                Some(bucket)
            }
            Path::Http { netloc, .. } => Some(netloc),
            Path::Local(_) => None,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Path::S3 { key, .. } | Path::Gs { key, .. } | Path::Ftp { key, .. } => key,
            Path::Http { path, .. } => path,
            Path::Local(p) => p,
        }
    }

    pub fn anchor(&self) -> String {
        match self.bucket() {
            Some(b) => format!("{}://{}", self.scheme(), b),
            None => String::new(),
        }
    }

    pub fn name(&self) -> String {
        self.key().rsplit('/').next().unwrap_or("").to_string()
    }

    pub fn stem(&self) -> String {
        let name = self.name();
        match name.rfind('.') {
            Some(idx) => name[..idx].to_string(),
            None => name,
        }
    }

    pub fn suffix(&self) -> String {
        let name = self.name();
        match name.rfind('.') {
            Some(idx) => name[idx..].to_string(),
            None => String::new(),
        }
    }

    pub fn suffixes(&self) -> Vec<String> {
        let mut out = vec![];
        let mut name = self.name();
        while let Some(idx) = name.rfind('.') {
            out.insert(0, name[idx..].to_string());
            name = name[..idx].to_string();
        }
        out
    }

    pub fn parent(&self) -> Path {
        match self {
            Path::Local(p) => {
                let parent = PathBuf::from(p);
                Path::Local(
                    parent
                        .parent()
                        .map(|p| p.to_string_lossy().to_string())
                        .unwrap_or_default(),
                )
            }
            Path::S3 { bucket, key } => Path::S3 { bucket: bucket.clone(), key: parent_key(key) },
            Path::Gs { bucket, key } => Path::Gs { bucket: bucket.clone(), key: parent_key(key) },
            Path::Ftp { bucket, key } => Path::Ftp { bucket: bucket.clone(), key: parent_key(key) },
            Path::Http { scheme, netloc, path } => {
                Path::Http { scheme: scheme.clone(), netloc: netloc.clone(), path: parent_key(path) }
            }
        }
    }

    pub fn parts(&self) -> Vec<String> {
        match self {
            Path::Local(p) => p.split('/').filter(|s| !s.is_empty()).map(String::from).collect(),
            _ => {
                let mut parts = vec![format!("{}://", self.scheme())];
                if let Some(b) = self.bucket() {
                    parts.push(b.to_string());
                }
                parts.extend(self.key().split('/').filter(|s| !s.is_empty()).map(String::from));
                parts
            }
        }
    }

    /// Joins `other` onto this path. Rejects joining an absolute `other`
    /// onto a remote path, matching `RemotePath.__truediv__`.
    pub fn join(&self, other: &str) -> Result<Path> {
        let other_path = Path::parse(other);
        match self {
            Path::Local(p) => Ok(Path::Local(
                PathBuf::from(p).join(other).to_string_lossy().to_string(),
            )),
            _ => {
                if other_path.is_absolute() {
                    return Err(FlowError::Configuration(
                        "cannot join an absolute path to another path".into(),
                    ));
                }
                let key = join_key(self.key(), other);
                Ok(match self {
                    Path::S3 { bucket, .. } => Path::S3 { bucket: bucket.clone(), key },
                    Path::Gs { bucket, .. } => Path::Gs { bucket: bucket.clone(), key },
                    Path::Ftp { bucket, .. } => Path::Ftp { bucket: bucket.clone(), key },
                    Path::Http { scheme, netloc, .. } => {
                        Path::Http { scheme: scheme.clone(), netloc: netloc.clone(), path: key }
                    }
                    Path::Local(_) => unreachable!(),
                })
            }
        }
    }

    /// The provider's HTTPS endpoint for a remote object.
    pub fn get_endpoint(&self, region: Option<&str>) -> Result<String> {
        match self {
            Path::S3 { bucket, key } => Ok(match region {
                Some(r) => format!("https://{bucket}.s3.{r}.amazonaws.com/{key}"),
                None => format!("https://s3.amazonaws.com/{bucket}/{key}"),
            }),
            Path::Gs { bucket, key } => Ok(match region {
                Some(r) => format!("https://storage{r}.rep.googleapis.com/{bucket}/{key}"),
                None => format!("https://storage.googleapis.com/{bucket}/{key}"),
            }),
            Path::Http { .. } | Path::Ftp { .. } => Ok(self.as_str()),
            Path::Local(_) => Err(FlowError::Configuration(
                "get_endpoint() is not defined for local paths".into(),
            )),
        }
    }

    /// Mirrors a remote path under `root` as a local path: `root/bucket/key`.
    pub fn get_local(&self, root: &str) -> Result<PathBuf> {
        match self.bucket() {
            Some(b) => Ok(PathBuf::from(root).join(b).join(self.key())),
            None => Err(FlowError::Configuration(
                "get_local() is not defined for local paths".into(),
            )),
        }
    }

    pub fn as_str(&self) -> String {
        match self {
            Path::Local(p) => p.clone(),
            Path::S3 { bucket, key } => format!("s3://{bucket}/{key}"),
            Path::Gs { bucket, key } => format!("gs://{bucket}/{key}"),
            Path::Ftp { bucket, key } => format!("ftp://{bucket}/{key}"),
            Path::Http { scheme, netloc, path } => format!("{scheme}://{netloc}{path}"),
        }
    }
}

fn split_bucket_key(rest: &str) -> (String, String) {
    match rest.split_once('/') {
        Some((bucket, key)) => (bucket.to_string(), key.trim_start_matches('/').to_string()),
        None => (rest.to_string(), String::new()),
    }
}

fn parent_key(key: &str) -> String {
    match key.rfind('/') {
        Some(idx) => key[..idx].to_string(),
        None => String::new(),
    }
}

fn join_key(base: &str, other: &str) -> String {
    if base.is_empty() {
        other.trim_start_matches('/').to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), other.trim_start_matches('/'))
    }
}

/// Resolves a user-supplied name against a root bucket and optional
/// data_prefix, per spec.md §4.A resolution rules.
pub struct Locator<'a> {
    pub bucket: Option<&'a str>,
    pub prefix: Option<&'a str>,
    pub wildcard: Option<(&'a str, &'a str)>,
}

impl<'a> Locator<'a> {
    pub fn resolve(&self, name: &str, use_wildcard: bool) -> Result<String> {
        let name = if use_wildcard {
            match self.wildcard {
                Some((pattern, replacement)) => {
                    let re = Regex::new(pattern).map_err(|e| {
                        FlowError::Configuration(format!("invalid wildcard pattern: {e}"))
                    })?;
                    re.replace_all(name, replacement).into_owned()
                }
                None => name.to_string(),
            }
        } else {
            name.to_string()
        };

        // Rule 1: absolute remote path passes through unchanged.
        if name.contains("://") {
            return Ok(name);
        }

        // Rule 2: bucket must exist and be absolute.
        let bucket = self
            .bucket
            .ok_or_else(|| FlowError::Configuration("locator bucket is not configured".into()))?;
        if !Path::parse(bucket).is_absolute() {
            return Err(FlowError::Configuration(format!(
                "configured bucket '{bucket}' is not absolute"
            )));
        }

        // Rule 3: absolute-local name is relative to root, ignoring prefix.
        if let Some(stripped) = name.strip_prefix('/') {
            return join_under(bucket, stripped);
        }

        // Rule 4: root/prefix/name; prefix must be relative and `..`-free.
        match self.prefix {
            Some(prefix) if !prefix.is_empty() => {
                if prefix.starts_with('/') || prefix.contains("://") {
                    return Err(FlowError::Configuration(format!(
                        "data_prefix '{prefix}' must be relative"
                    )));
                }
                if prefix.split('/').any(|seg| seg == "..") {
                    return Err(FlowError::Configuration(format!(
                        "data_prefix '{prefix}' must not contain '..' segments"
                    )));
                }
                join_under(bucket, &format!("{}/{}", prefix.trim_matches('/'), name))
            }
            _ => join_under(bucket, &name),
        }
    }
}

fn join_under(bucket: &str, rest: &str) -> Result<String> {
    let base = Path::parse(bucket);
    base.join(rest).map(|p| p.as_str())
}

/// Supported inline table functions the raw-SQL rewriter scans for.
const LOCATOR_FUNCTIONS: &[&str] = &["delta_scan", "read_parquet"];

/// Rewrites `delta_scan('...')` / `read_parquet('...')` literal arguments
/// in raw SQL, substituting the resolved long locator for a short one that
/// matches the connection's configured locator exactly.
///
/// Mirrors the original implementation's `_raw_sql_rewriter`: for every
/// match, an already-absolute argument is left untouched; otherwise the
/// argument must equal `short_locator` exactly or the call fails.
pub fn rewrite_locators(sql: &str, short_locator: &str, long_locator: &str) -> Result<String> {
    let mut out = sql.to_string();
    for func in LOCATOR_FUNCTIONS {
        let pattern = format!(r#"{func}\(\s*(['"])([^'"]+)\1"#);
        let re = Regex::new(&pattern).expect("static regex is valid");
        let mut rewritten = String::new();
        let mut last_end = 0;
        for caps in re.captures_iter(&out.clone()) {
            let whole = caps.get(0).unwrap();
            let arg = caps.get(2).unwrap().as_str();
            rewritten.push_str(&out[last_end..whole.start()]);
            if Path::parse(arg).is_absolute() {
                rewritten.push_str(whole.as_str());
            } else if arg == short_locator {
                rewritten.push_str(&whole.as_str().replacen(arg, long_locator, 1));
            } else {
                return Err(FlowError::Configuration(format!(
                    "locator '{arg}' in raw SQL does not match connection locator '{short_locator}'"
                )));
            }
            last_end = whole.end();
        }
        rewritten.push_str(&out[last_end..]);
        out = rewritten;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_schemes() {
        assert!(matches!(Path::parse("s3://bucket/key.csv"), Path::S3 { .. }));
        assert!(matches!(Path::parse("gs://bucket/key.csv"), Path::Gs { .. }));
        assert!(matches!(Path::parse("/local/abs"), Path::Local(_)));
        assert!(matches!(Path::parse("relative/path"), Path::Local(_)));
    }

    #[test]
    fn s3_endpoint_regional_vs_global() {
        let p = Path::parse("s3://bucket/key.csv");
        assert_eq!(
            p.get_endpoint(Some("eu-west-1")).unwrap(),
            "https://bucket.s3.eu-west-1.amazonaws.com/key.csv"
        );
        assert_eq!(
            p.get_endpoint(None).unwrap(),
            "https://s3.amazonaws.com/bucket/key.csv"
        );
    }

    #[test]
    fn locator_absolute_remote_passthrough() {
        let loc = Locator { bucket: Some("s3://root"), prefix: None, wildcard: None };
        assert_eq!(loc.resolve("s3://other/file.csv", false).unwrap(), "s3://other/file.csv");
    }

    #[test]
    fn locator_absolute_local_ignores_prefix() {
        let loc = Locator { bucket: Some("s3://root"), prefix: Some("data"), wildcard: None };
        assert_eq!(loc.resolve("/file.csv", false).unwrap(), "s3://root/file.csv");
    }

    #[test]
    fn locator_missing_bucket_fails() {
        let loc = Locator { bucket: None, prefix: None, wildcard: None };
        assert!(loc.resolve("file.csv", false).is_err());
    }

    #[test]
    fn locator_prefix_with_dotdot_fails() {
        let loc = Locator { bucket: Some("s3://root"), prefix: Some("../escape"), wildcard: None };
        assert!(loc.resolve("file.csv", false).is_err());
    }

    #[test]
    fn locator_relative_joins_root_prefix_name() {
        let loc = Locator { bucket: Some("s3://root"), prefix: Some("data"), wildcard: None };
        assert_eq!(loc.resolve("file.csv", false).unwrap(), "s3://root/data/file.csv");
    }

    #[test]
    fn rewrite_locators_substitutes_matching_short_locator() {
        let sql = "SELECT * FROM delta_scan('sales') WHERE x > 1";
        let out = rewrite_locators(sql, "sales", "s3://bucket/sales").unwrap();
        assert_eq!(out, "SELECT * FROM delta_scan('s3://bucket/sales') WHERE x > 1");
    }

    #[test]
    fn rewrite_locators_leaves_absolute_untouched() {
        let sql = "SELECT * FROM read_parquet('s3://bucket/x.parquet')";
        let out = rewrite_locators(sql, "sales", "s3://bucket/sales").unwrap();
        assert_eq!(out, sql);
    }

    #[test]
    fn rewrite_locators_rejects_mismatched_short_locator() {
        let sql = "SELECT * FROM delta_scan('other_table')";
        assert!(rewrite_locators(sql, "sales", "s3://bucket/sales").is_err());
    }
}
