//! Path-scoped, hot-reloadable access control for filesystem-touching
//! tools.
//!
//! Grounded on `examples/original_source/mcp_server/operate_file/security.py`:
//! `AccessScope` (denied/shallow/recursive), longest-prefix-match rule
//! resolution, TTL expiry, and the exact check ordering in
//! `validate_access` (expiry, then implicit deny, then scope, then depth,
//! then the requested action bit).

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::error::SwitchboardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessScope {
    Denied = 0,
    Shallow = 1,
    Recursive = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Create,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub scope: AccessScope,
    #[serde(default)]
    pub allow_read: bool,
    #[serde(default)]
    pub allow_write: bool,
    #[serde(default)]
    pub allow_create: bool,
    #[serde(default)]
    pub allow_delete: bool,
    /// Unix timestamp; `None` means the rule never expires.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub whitelist_patterns: Vec<String>,
    #[serde(default)]
    pub blacklist_patterns: Vec<String>,
}

impl PermissionRule {
    fn allows(&self, action: Action) -> bool {
        match action {
            Action::Read => self.allow_read,
            Action::Write => self.allow_write,
            Action::Create => self.allow_create,
            Action::Delete => self.allow_delete,
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PermissionsFile {
    #[serde(default)]
    rules: HashMap<String, PermissionRule>,
}

struct Loaded {
    rules: HashMap<PathBuf, PermissionRule>,
    mtime: Option<SystemTime>,
}

/// Checks filesystem tool calls against a JSON rule file, reloading it
/// whenever its mtime changes.
pub struct PermissionGate {
    path: PathBuf,
    state: RwLock<Loaded>,
}

fn glob_match(pattern: &str, name: &str) -> bool {
    // A small subset of glob (`*` and `?`) is all security.py's
    // whitelist/blacklist patterns use.
    fn helper(p: &[u8], s: &[u8]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => helper(&p[1..], s) || (!s.is_empty() && helper(p, &s[1..])),
            (Some(b'?'), Some(_)) => helper(&p[1..], &s[1..]),
            (Some(pc), Some(sc)) if pc == sc => helper(&p[1..], &s[1..]),
            _ => false,
        }
    }
    helper(pattern.as_bytes(), name.as_bytes())
}

impl PermissionGate {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = Self::load_state(&path)?;
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn load_state(path: &Path) -> Result<Loaded> {
        if !path.exists() {
            return Ok(Loaded {
                rules: HashMap::new(),
                mtime: None,
            });
        }
        let mtime = std::fs::metadata(path).ok().and_then(|m| m.modified().ok());
        let text = std::fs::read_to_string(path)
            .map_err(|e| SwitchboardError::Config(format!("failed to read {}: {e}", path.display())))?;
        let parsed: PermissionsFile = serde_json::from_str(&text)
            .map_err(|e| SwitchboardError::Config(format!("failed to parse {}: {e}", path.display())))?;
        let rules = parsed
            .rules
            .into_iter()
            .map(|(p, rule)| (PathBuf::from(p), rule))
            .collect();
        Ok(Loaded { rules, mtime })
    }

    /// Writes the current rule set back to `self.path` as temp-file +
    /// rename, so a reader (including our own mtime-gated reload) never
    /// observes a half-written file. The Python reference does a direct
    /// `json.dump`, which spec.md §5 calls out as a gap this port closes.
    fn save(&self) -> Result<()> {
        let state = self.state.read().expect("permission gate lock poisoned");
        let file = PermissionsFile {
            rules: state
                .rules
                .iter()
                .map(|(p, rule)| (p.display().to_string(), rule.clone()))
                .collect(),
        };
        drop(state);

        let text = serde_json::to_string_pretty(&file).map_err(|e| SwitchboardError::Config(e.to_string()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, text)
            .map_err(|e| SwitchboardError::Config(format!("failed to write {}: {e}", tmp_path.display())))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| SwitchboardError::Config(format!("failed to persist {}: {e}", self.path.display())))?;

        let mtime = std::fs::metadata(&self.path).ok().and_then(|m| m.modified().ok());
        self.state.write().expect("permission gate lock poisoned").mtime = mtime;
        Ok(())
    }

    /// Adds or overwrites the rule for `path`, then persists it.
    pub fn grant(&self, path: impl Into<PathBuf>, rule: PermissionRule) -> Result<()> {
        let path = path.into();
        self.state
            .write()
            .expect("permission gate lock poisoned")
            .rules
            .insert(path, rule);
        self.save()
    }

    /// Removes the rule for `path`, if any, then persists the change.
    pub fn revoke(&self, path: &Path) -> Result<()> {
        self.state
            .write()
            .expect("permission gate lock poisoned")
            .rules
            .remove(path);
        self.save()
    }

    fn reload_if_changed(&self) -> Result<()> {
        let current_mtime = std::fs::metadata(&self.path).ok().and_then(|m| m.modified().ok());
        let needs_reload = {
            let state = self.state.read().expect("permission gate lock poisoned");
            state.mtime != current_mtime
        };
        if needs_reload {
            let fresh = Self::load_state(&self.path)?;
            *self.state.write().expect("permission gate lock poisoned") = fresh;
        }
        Ok(())
    }

    /// Resolves the rule that governs `target` via longest-prefix match,
    /// returning both the rule and the path it is bound to (the key it
    /// matched on) so callers needing that path (e.g. the shallow-depth
    /// check) never have to re-resolve it themselves.
    fn effective_rule(&self, target: &Path) -> Option<(PathBuf, PermissionRule)> {
        let state = self.state.read().expect("permission gate lock poisoned");
        if let Some(rule) = state.rules.get(target) {
            return Some((target.to_path_buf(), rule.clone()));
        }
        let mut candidates: Vec<&PathBuf> = state
            .rules
            .keys()
            .filter(|rule_path| target.starts_with(rule_path.as_path()))
            .collect();
        candidates.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        candidates.first().map(|p| ((*p).clone(), state.rules[*p].clone()))
    }

    /// Deletes the rule bound to `rule_path` and persists the change.
    fn delete_rule(&self, rule_path: &Path) -> Result<()> {
        self.state
            .write()
            .expect("permission gate lock poisoned")
            .rules
            .remove(rule_path);
        self.save()
    }

    /// The full check sequence: reload-if-stale, expiry, implicit deny,
    /// scope, shallow-depth, then the requested action bit.
    pub fn validate_access(&self, target: &Path, action: Action) -> Result<()> {
        self.reload_if_changed()?;

        let now = chrono::Utc::now().timestamp();
        let path_str = target.display().to_string();

        let Some((rule_path, rule)) = self.effective_rule(target) else {
            return Err(SwitchboardError::ImplicitDeny { path: path_str });
        };

        if rule.is_expired(now) {
            self.delete_rule(&rule_path)?;
            return Err(SwitchboardError::ImplicitDeny { path: path_str });
        }

        if let Some(name) = target.file_name().and_then(|n| n.to_str()) {
            if rule.blacklist_patterns.iter().any(|pat| glob_match(pat, name)) {
                return Err(SwitchboardError::ExplicitDeny {
                    path: path_str,
                    reason: "path matches a blacklist pattern".to_string(),
                });
            }
            if !rule.whitelist_patterns.is_empty() && !rule.whitelist_patterns.iter().any(|pat| glob_match(pat, name)) {
                return Err(SwitchboardError::ExplicitDeny {
                    path: path_str,
                    reason: "path does not match any whitelist pattern".to_string(),
                });
            }
        }

        if rule.scope == AccessScope::Denied {
            return Err(SwitchboardError::ExplicitDeny {
                path: path_str,
                reason: "scope is denied".to_string(),
            });
        }

        if rule.scope == AccessScope::Shallow {
            // Shallow grants apply to the rule's own directory only, not
            // to descendants nested further down.
            let depth_ok = target.parent() == Some(rule_path.as_path()) || target == rule_path.as_path();
            if !depth_ok {
                return Err(SwitchboardError::ExplicitDeny {
                    path: path_str,
                    reason: "scope is shallow; target is nested too deep".to_string(),
                });
            }
        }

        if !rule.allows(action) {
            return Err(SwitchboardError::ExplicitDeny {
                path: path_str,
                reason: format!("action {action:?} is not permitted"),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_rules(dir: &std::path::Path, json: &str) -> PathBuf {
        let path = dir.join("permissions.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn no_matching_rule_is_an_implicit_deny() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rules(dir.path(), r#"{"rules": {}}"#);
        let gate = PermissionGate::load(path).unwrap();
        let err = gate.validate_access(Path::new("/tmp/somewhere/file.txt"), Action::Read).unwrap_err();
        assert!(matches!(err, SwitchboardError::ImplicitDeny { .. }));
    }

    #[test]
    fn exact_rule_grants_allowed_action() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("workspace");
        let json = format!(
            r#"{{"rules": {{"{}": {{"scope": "recursive", "allow_read": true}}}}}}"#,
            target.display()
        );
        let path = write_rules(dir.path(), &json);
        let gate = PermissionGate::load(path).unwrap();
        gate.validate_access(&target.join("notes.txt"), Action::Read).unwrap();
    }

    #[test]
    fn denies_action_not_granted_by_rule() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("workspace");
        let json = format!(
            r#"{{"rules": {{"{}": {{"scope": "recursive", "allow_read": true}}}}}}"#,
            target.display()
        );
        let path = write_rules(dir.path(), &json);
        let gate = PermissionGate::load(path).unwrap();
        let err = gate.validate_access(&target.join("notes.txt"), Action::Write).unwrap_err();
        assert!(matches!(err, SwitchboardError::ExplicitDeny { .. }));
    }

    #[test]
    fn shallow_scope_rejects_nested_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("workspace");
        let json = format!(
            r#"{{"rules": {{"{}": {{"scope": "shallow", "allow_read": true}}}}}}"#,
            target.display()
        );
        let path = write_rules(dir.path(), &json);
        let gate = PermissionGate::load(path).unwrap();
        gate.validate_access(&target.join("top.txt"), Action::Read).unwrap();
        let err = gate
            .validate_access(&target.join("nested/deep.txt"), Action::Read)
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::ExplicitDeny { .. }));
    }

    #[test]
    fn longest_prefix_rule_wins_over_shorter_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspace");
        let nested = root.join("secrets");
        let json = format!(
            r#"{{"rules": {{
                "{}": {{"scope": "recursive", "allow_read": true}},
                "{}": {{"scope": "denied"}}
            }}}}"#,
            root.display(),
            nested.display()
        );
        let path = write_rules(dir.path(), &json);
        let gate = PermissionGate::load(path).unwrap();
        let err = gate.validate_access(&nested.join("key.txt"), Action::Read).unwrap_err();
        assert!(matches!(err, SwitchboardError::ExplicitDeny { .. }));
    }

    #[test]
    fn expired_rule_is_denied_implicitly_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("workspace");
        let json = format!(
            r#"{{"rules": {{"{}": {{"scope": "recursive", "allow_read": true, "expires_at": 1}}}}}}"#,
            target.display()
        );
        let path = write_rules(dir.path(), &json);
        let gate = PermissionGate::load(&path).unwrap();
        let err = gate.validate_access(&target.join("f.txt"), Action::Read).unwrap_err();
        assert!(matches!(err, SwitchboardError::ImplicitDeny { .. }));

        // Expiry deletes the rule and persists that deletion; a fresh
        // load sees no rule at all, not a re-expired one.
        let reloaded = PermissionGate::load(&path).unwrap();
        let err = reloaded.validate_access(&target.join("f.txt"), Action::Read).unwrap_err();
        assert!(matches!(err, SwitchboardError::ImplicitDeny { .. }));
    }

    #[test]
    fn grant_persists_a_new_rule_that_a_fresh_load_can_see() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("workspace");
        let path = write_rules(dir.path(), r#"{"rules": {}}"#);
        let gate = PermissionGate::load(&path).unwrap();
        gate.grant(
            target.clone(),
            PermissionRule {
                scope: AccessScope::Recursive,
                allow_read: true,
                allow_write: false,
                allow_create: false,
                allow_delete: false,
                expires_at: None,
                whitelist_patterns: vec![],
                blacklist_patterns: vec![],
            },
        )
        .unwrap();

        let reloaded = PermissionGate::load(&path).unwrap();
        reloaded.validate_access(&target.join("note.txt"), Action::Read).unwrap();
    }

    #[test]
    fn revoke_removes_a_rule_so_access_falls_back_to_implicit_deny() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("workspace");
        let json = format!(
            r#"{{"rules": {{"{}": {{"scope": "recursive", "allow_read": true}}}}}}"#,
            target.display()
        );
        let path = write_rules(dir.path(), &json);
        let gate = PermissionGate::load(&path).unwrap();
        gate.validate_access(&target.join("note.txt"), Action::Read).unwrap();

        gate.revoke(&target).unwrap();
        let err = gate.validate_access(&target.join("note.txt"), Action::Read).unwrap_err();
        assert!(matches!(err, SwitchboardError::ImplicitDeny { .. }));
    }
}
