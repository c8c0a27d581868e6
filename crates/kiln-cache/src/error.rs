use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache persistence and artifact management.
///
/// Most read-side problems never surface as errors: a corrupt record is a miss for that key and an
/// unparsable cache file restarts empty. These variants cover the write side and explicit
/// operations where the caller has to know something went wrong.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {message}")]
    Json { message: String },

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("path {path} is not under cache root {cache_root}")]
    PathNotUnderCacheRoot { path: PathBuf, cache_root: PathBuf },

    #[error("artifact {path} does not exist or is not a regular file")]
    MissingArtifact { path: PathBuf },

    #[error("incompatible cache schema version for {path}: expected {expected}, found {found}")]
    IncompatibleSchemaVersion {
        path: PathBuf,
        expected: u32,
        found: u32,
    },
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        // Cache records carry user paths and build keys; don't echo string values back.
        let message = sanitize_json_error_message(&err.to_string());
        Self::Json { message }
    }
}

fn sanitize_json_error_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let bytes = rest.as_bytes();
        let end = bytes.iter().enumerate().find_map(|(idx, &b)| {
            if b != b'"' {
                return None;
            }
            // A quote preceded by an odd number of backslashes is escaped.
            let backslashes = bytes[..idx]
                .iter()
                .rev()
                .take_while(|&&c| c == b'\\')
                .count();
            (backslashes % 2 == 0).then_some(idx)
        });

        match end {
            Some(end) => {
                out.push_str("<redacted>\"");
                rest = &rest[end + 1..];
            }
            None => {
                out.push_str("<redacted>");
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);

    // serde wraps unknown fields in backticks: "unknown field `secret`, expected ...".
    if let Some(start) = out.find('`') {
        let after_start = &out[start + 1..];
        let end_rel = after_start
            .find("`, expected")
            .or_else(|| after_start.find('`'));
        if let Some(end_rel) = end_rel {
            let end = start + 1 + end_rel;
            out.replace_range(start + 1..end, "<redacted>");
        }
    }

    out
}
