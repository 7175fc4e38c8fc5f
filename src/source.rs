//! Source image loading (spec §4.4): POST body, proxied HTTP(S) fetch, or
//! local disk read, in that priority order, with directory-traversal
//! protection on every path that touches the filesystem.

use std::path::PathBuf;

use reqwest::Client;

use crate::error::{DirpyError, Result};
use crate::query::{OptionBag, OptionValue};

pub struct LoadedSource {
    pub bytes: Vec<u8>,
    pub file_path: String,
}

/// Normalize `"/" + rel_path` first (a leading slash blocks `..` escaping
/// above the root), then join onto `root`. Mirrors the original's
/// `os.path.normpath(cfg.http_root + os.path.normpath("/" + rel_file))`.
pub fn join_root(root: &str, rel_path: &str) -> PathBuf {
    let prefixed = format!("/{rel_path}");
    let normalized = posix_normpath(&prefixed);
    let joined = format!("{root}{normalized}");
    PathBuf::from(posix_normpath(&joined))
}

/// A pure-string POSIX `normpath`: collapses `.`, `..`, and repeated `/`
/// without touching the filesystem. `..` past the root simply stops at `/`.
fn posix_normpath(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if !stack.is_empty() && *stack.last().unwrap() != ".." {
                    stack.pop();
                } else if !absolute {
                    stack.push("..");
                }
            }
            other => stack.push(other),
        }
    }
    let joined = stack.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Load an image's raw bytes, choosing between POST body, proxied fetch,
/// or a local file read exactly as the original's `load()` does: POST
/// data wins if present and allowed, then proxy (unless `fallback` is set
/// and the local file already exists), then local disk.
pub async fn load(
    http_root: &str,
    rel_file: &str,
    opts: &OptionBag,
    post_body: Option<&[u8]>,
    allow_post: bool,
) -> Result<LoadedSource> {
    let local_file = join_root(http_root, rel_file);

    let proxy = opts.get("proxy").and_then(OptionValue::as_str);
    let fallback = opts.contains_key("fallback");
    let from_post = opts.contains_key("post");

    if from_post {
        if let Some(body) = post_body {
            if !allow_post {
                return Err(DirpyError::user("POST prohibited."));
            }
            return Ok(LoadedSource {
                bytes: body.to_vec(),
                file_path: "POST_file".to_string(),
            });
        }
    }

    if let Some(proxy) = proxy {
        if !(fallback && local_file.is_file()) {
            let url = format!("{proxy}{rel_file}");
            let client = Client::new();
            let resp = client
                .get(&url)
                .header("User-Agent", format!("Dirpy/{}", env!("CARGO_PKG_VERSION")))
                .send()
                .await
                .map_err(|e| DirpyError::fatal_status(format!("Error reading file: {e}"), 500))?;

            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                return Err(DirpyError::fatal_status(
                    format!("Error reading file: upstream status {status}"),
                    status,
                ));
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|e| DirpyError::fatal(format!("Error reading file: {e}")))?
                .to_vec();

            return Ok(LoadedSource { bytes, file_path: url });
        }
    }

    let bytes = tokio::fs::read(&local_file)
        .await
        .map_err(|e| DirpyError::fatal_status(format!("Error reading file: {e}"), 500))?;
    Ok(LoadedSource {
        bytes,
        file_path: local_file.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normpath_collapses_dotdot() {
        assert_eq!(posix_normpath("/a/b/../c"), "/a/c");
        assert_eq!(posix_normpath("/a/../../c"), "/c");
        assert_eq!(posix_normpath("/../../../etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn join_root_prevents_traversal_above_http_root() {
        let p = join_root("/var/www/html", "../../etc/passwd");
        assert_eq!(p, PathBuf::from("/var/www/html/etc/passwd"));
    }

    #[test]
    fn join_root_handles_plain_relative_path() {
        let p = join_root("/var/www/html", "images/a.jpg");
        assert_eq!(p, PathBuf::from("/var/www/html/images/a.jpg"));
    }
}
