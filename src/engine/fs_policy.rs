// ── Viking Bridge: FS Write Policy Gate ────────────────────────────────────
//
// Every mutating store-fs operation (mkdir, rm, mv) passes this gate before
// the client issues the request. The gate is pure: it normalizes the target
// uri and applies the allow/deny/protected rules, in order, failing fast
// with a user-visible message naming the rule that fired. Reads (ls, tree,
// stat) are not gated.
//
// Prefix matching respects path boundaries: a prefix matches a uri when they
// are equal or the uri continues with "/" after the prefix. The literal
// `viking://` prefix matches every store uri.

use crate::atoms::constants::VIKING_SCHEME;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::FsWriteConfig;

pub struct FsWritePolicy {
    config: FsWriteConfig,
}

impl FsWritePolicy {
    pub fn new(config: FsWriteConfig) -> Self {
        Self { config }
    }

    // ── Vetting entry points ───────────────────────────────────────────────

    /// Vet a directory creation. Returns the normalized uri for the client
    /// call.
    pub fn vet_mkdir(&self, uri: &str) -> EngineResult<String> {
        self.vet_common(uri)
    }

    /// Vet a removal. Recursive removals additionally require
    /// `allowRecursiveRm`.
    pub fn vet_rm(&self, uri: &str, recursive: bool) -> EngineResult<String> {
        if !self.config.enabled {
            return Err(EngineError::fs_denied("fs writes are disabled"));
        }
        if recursive && !self.config.allow_recursive_rm {
            return Err(EngineError::fs_denied("recursive rm is disabled (allowRecursiveRm)"));
        }
        self.vet_common(uri)
    }

    /// Vet a move. Source and destination are each vetted and must be
    /// distinct after normalization.
    pub fn vet_mv(&self, from_uri: &str, to_uri: &str) -> EngineResult<(String, String)> {
        if !self.config.enabled {
            return Err(EngineError::fs_denied("fs writes are disabled"));
        }
        let from = normalize_uri(from_uri)?;
        let to = normalize_uri(to_uri)?;
        if from == to {
            return Err(EngineError::fs_denied(format!(
                "mv source and destination are the same uri: {from}"
            )));
        }
        let from = self.vet_common(&from)?;
        let to = self.vet_common(&to)?;
        Ok((from, to))
    }

    // ── Rule chain ─────────────────────────────────────────────────────────

    fn vet_common(&self, uri: &str) -> EngineResult<String> {
        if !self.config.enabled {
            return Err(EngineError::fs_denied("fs writes are disabled"));
        }

        let uri = normalize_uri(uri)?;

        if self.config.allow_uri_prefixes.is_empty() {
            return Err(EngineError::fs_denied("no allowed uri prefixes configured"));
        }

        if self.config.protected_uris.iter().any(|p| p == &uri) {
            return Err(EngineError::fs_denied(format!("uri is protected: {uri}")));
        }

        if let Some(denied) =
            self.config.deny_uri_prefixes.iter().find(|p| prefix_matches(p, &uri))
        {
            return Err(EngineError::fs_denied(format!(
                "uri {uri} matches deny prefix {denied}"
            )));
        }

        if !self.config.allow_uri_prefixes.iter().any(|p| prefix_matches(p, &uri)) {
            return Err(EngineError::fs_denied(format!("uri {uri} is outside allowed prefixes")));
        }

        Ok(uri)
    }
}

// ── Uri helpers ────────────────────────────────────────────────────────────

/// Require the `viking://` scheme and strip trailing slashes from non-root
/// uris (the root itself stays untouched).
fn normalize_uri(raw: &str) -> EngineResult<String> {
    let trimmed = raw.trim();
    if !trimmed.starts_with(VIKING_SCHEME) {
        return Err(EngineError::fs_denied(format!(
            "uri must start with {VIKING_SCHEME} (got '{trimmed}')"
        )));
    }
    let mut uri = trimmed;
    while uri.len() > VIKING_SCHEME.len() && uri.ends_with('/') {
        uri = &uri[..uri.len() - 1];
    }
    Ok(uri.to_string())
}

fn prefix_matches(prefix: &str, uri: &str) -> bool {
    if prefix == VIKING_SCHEME {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    uri == prefix || uri.starts_with(&format!("{prefix}/"))
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn docs_policy() -> FsWritePolicy {
        FsWritePolicy::new(FsWriteConfig {
            enabled: true,
            allow_uri_prefixes: vec!["viking://resources/docs".into()],
            deny_uri_prefixes: vec![],
            protected_uris: vec!["viking://resources/docs/protected".into()],
            allow_recursive_rm: false,
        })
    }

    #[test]
    fn mkdir_inside_allowed_prefix_succeeds() {
        let uri = docs_policy().vet_mkdir("viking://resources/docs/new").unwrap();
        assert_eq!(uri, "viking://resources/docs/new");
    }

    #[test]
    fn trailing_slashes_are_normalized_away() {
        let uri = docs_policy().vet_mkdir("viking://resources/docs/new///").unwrap();
        assert_eq!(uri, "viking://resources/docs/new");
    }

    #[test]
    fn disabled_gate_refuses_everything() {
        let policy = FsWritePolicy::new(FsWriteConfig {
            enabled: false,
            allow_uri_prefixes: vec!["viking://".into()],
            ..Default::default()
        });
        let err = policy.vet_mkdir("viking://resources/docs/x").unwrap_err();
        assert!(err.to_string().starts_with("fs write denied:"));
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn non_viking_uri_is_refused() {
        let err = docs_policy().vet_mkdir("/etc/passwd").unwrap_err();
        assert!(err.to_string().contains("must start with viking://"));
    }

    #[test]
    fn empty_allow_list_refuses() {
        let policy = FsWritePolicy::new(FsWriteConfig {
            enabled: true,
            allow_uri_prefixes: vec![],
            ..Default::default()
        });
        let err = policy.vet_mkdir("viking://resources/docs/x").unwrap_err();
        assert!(err.to_string().contains("no allowed uri prefixes"));
    }

    #[test]
    fn protected_uri_is_exact_match_only() {
        let policy = docs_policy();
        let err = policy.vet_mkdir("viking://resources/docs/protected").unwrap_err();
        assert!(err.to_string().contains("protected"));
        // A child of the protected uri is not itself protected.
        assert!(policy.vet_mkdir("viking://resources/docs/protected-adjacent").is_ok());
    }

    #[test]
    fn deny_prefix_beats_allow_prefix() {
        let policy = FsWritePolicy::new(FsWriteConfig {
            enabled: true,
            allow_uri_prefixes: vec!["viking://resources".into()],
            deny_uri_prefixes: vec!["viking://resources/docs/generated".into()],
            protected_uris: vec![],
            allow_recursive_rm: true,
        });
        let err = policy.vet_mkdir("viking://resources/docs/generated/sub").unwrap_err();
        assert!(err.to_string().contains("deny prefix"));
        assert!(policy.vet_mkdir("viking://resources/docs/handwritten").is_ok());
    }

    #[test]
    fn prefix_matching_respects_path_boundaries() {
        let policy = docs_policy();
        // "docsx" shares the byte prefix but not the path boundary.
        let err = policy.vet_mkdir("viking://resources/docsx").unwrap_err();
        assert!(err.to_string().contains("outside allowed prefixes"));
        // The allow prefix itself is a valid target.
        assert!(policy.vet_mkdir("viking://resources/docs").is_ok());
    }

    #[test]
    fn literal_root_prefix_matches_anything() {
        let policy = FsWritePolicy::new(FsWriteConfig {
            enabled: true,
            allow_uri_prefixes: vec!["viking://".into()],
            ..Default::default()
        });
        assert!(policy.vet_mkdir("viking://anywhere/at/all").is_ok());
    }

    #[test]
    fn recursive_rm_needs_its_own_switch() {
        let policy = docs_policy();
        let err = policy.vet_rm("viking://resources/docs/old", true).unwrap_err();
        assert!(err.to_string().contains("recursive rm is disabled"));
        // Non-recursive rm of the same target is fine.
        assert!(policy.vet_rm("viking://resources/docs/old", false).is_ok());
    }

    #[test]
    fn mv_into_protected_target_fails() {
        let err = docs_policy()
            .vet_mv("viking://resources/docs/a", "viking://resources/docs/protected")
            .unwrap_err();
        assert!(err.to_string().contains("protected"));
    }

    #[test]
    fn mv_to_same_uri_fails_before_rule_checks() {
        let err = docs_policy()
            .vet_mv("viking://resources/docs/a", "viking://resources/docs/a/")
            .unwrap_err();
        assert!(err.to_string().contains("same uri"));
    }

    #[test]
    fn mv_with_both_sides_allowed_returns_normalized_pair() {
        let (from, to) = docs_policy()
            .vet_mv("viking://resources/docs/a/", "viking://resources/docs/b")
            .unwrap();
        assert_eq!(from, "viking://resources/docs/a");
        assert_eq!(to, "viking://resources/docs/b");
    }
}
