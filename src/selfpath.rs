//! Reference model for the self-exec candidate resolution the detach patch
//! installs into the client.
//!
//! The client's default "current executable" lookup resolves to a
//! `/proc/self/…` pseudo-path inside restricted namespaces, which does not
//! survive re-exec. The installed Go helpers therefore build an ordered,
//! deduplicated list of plausible self-executable paths and try each in
//! turn. This module mirrors those semantics as pure functions over injected
//! probe results so the behavior is unit-testable; a test in the repository
//! catalog keeps the injected Go source in sync with the constants here.

/// Prefix of the per-process pseudo-filesystem; paths under it are valid
/// only within the current process's namespace view.
pub const PROC_PREFIX: &str = "/proc/";

/// Error text returned by the installed `Fork` when no candidate survives
/// filtering.
pub const UNRESOLVED_ERROR: &str = "unable to resolve self path for re-exec";

/// Probe results feeding candidate enumeration, precomputed by the caller.
///
/// The installed Go code gathers these from its own process state
/// (`os.Args[0]`, `exec.LookPath`, `filepath.Abs`, `os.Executable`); here
/// they are plain data so enumeration is deterministic under test.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelfExecProbes {
    /// Explicitly configured self-path, if any.
    pub configured: Option<String>,
    /// The zeroth command-line argument.
    pub argv0: Option<String>,
    /// `argv0` resolved against the search path.
    pub path_lookup: Option<String>,
    /// The search-path resolution made absolute.
    pub path_lookup_abs: Option<String>,
    /// `argv0` made absolute directly.
    pub argv0_abs: Option<String>,
    /// The platform's own current-executable query.
    pub current_exe: Option<String>,
}

/// Strip one layer of quoting from a candidate path.
///
/// A well-formed double-quoted string is unescaped; anything else has
/// surrounding quote characters trimmed. Empty input yields empty output.
pub fn normalize(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }

    if let Some(unquoted) = unquote(path) {
        return unquoted;
    }

    path.trim_matches(|c| c == '"' || c == '\'').to_string()
}

/// Unescape a double-quoted string, or `None` if `path` is not one.
fn unquote(path: &str) -> Option<String> {
    let inner = path.strip_prefix('"')?.strip_suffix('"')?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                other => out.push(other),
            }
        } else if c == '"' {
            // An unescaped interior quote means this was never one quoted
            // string; fall back to trimming.
            return None;
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// True for paths under the per-process pseudo-filesystem, which are
/// unusable after re-exec into a new process.
pub fn is_proc_path(path: &str) -> bool {
    path.starts_with(PROC_PREFIX)
}

/// Build the ordered, deduplicated candidate list.
///
/// Candidates are considered in a fixed order: the configured path, the
/// search-path resolution of argv0 (as returned and made absolute), argv0
/// made absolute directly, and the current-executable query. Each is
/// normalized, then dropped if empty, namespace-relative, or already seen.
pub fn self_exec_candidates(probes: &SelfExecProbes) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::with_capacity(4);

    let mut add = |path: &str, candidates: &mut Vec<String>| {
        let path = normalize(path);
        if path.is_empty() || is_proc_path(&path) {
            return;
        }
        if candidates.iter().any(|seen| *seen == path) {
            return;
        }
        candidates.push(path);
    };

    if let Some(configured) = &probes.configured {
        if !configured.is_empty() {
            add(configured, &mut candidates);
        }
    }

    let argv0_usable = probes.argv0.as_deref().is_some_and(|a| !a.is_empty());
    if argv0_usable {
        if let Some(found) = &probes.path_lookup {
            add(found, &mut candidates);
            if let Some(abs) = &probes.path_lookup_abs {
                add(abs, &mut candidates);
            }
        }
        if let Some(abs) = &probes.argv0_abs {
            add(abs, &mut candidates);
        }
    }

    if let Some(exe) = &probes.current_exe {
        add(exe, &mut candidates);
    }

    candidates
}
