//! Client-repository patches: explicit self-path resolution for re-exec.
//!
//! Inside restricted process namespaces the client's `/proc/self/exe`
//! lookup resolves to a pseudo-path that dies with the namespace, so the
//! daemonize step cannot re-exec. These five patches thread a `SelfPath`
//! setting from the CLI and the server-side build tooling through to the
//! fork entry point, and teach the fork entry point to enumerate robust
//! self-executable candidates. See `selfpath` for the reference model of
//! the enumeration semantics installed here.

use std::sync::LazyLock;

use regex::Regex;

use crate::patch::{
    insert_after, insert_line_after, replace_if_present, replace_once, AnchorPatch,
    TransformError,
};

pub const DETACH_FILE: &str = "cmd/client/detach.go";
pub const MAIN_FILE: &str = "cmd/client/main.go";
pub const CLIENT_FILE: &str = "internal/client/client.go";
pub const LINK_FILE: &str = "internal/server/commands/link.go";
pub const BUILDMANAGER_FILE: &str = "internal/server/webserver/buildmanager.go";

pub const PATCHES: [AnchorPatch; 5] = [
    AnchorPatch {
        id: "detach-self-exec-candidates",
        description: "install self-path helpers and rewrite Fork to iterate candidates",
        relative_path: DETACH_FILE,
        markers: &["normalizeSelfPath", "selfExecCandidates"],
        transform: patch_detach,
    },
    AnchorPatch {
        id: "main-self-path-flag",
        description: "add the --self-path flag to usage, help, parsing and settings",
        relative_path: MAIN_FILE,
        markers: &["GetArgString(\"self-path\")", "SelfPath", "--self-path"],
        transform: patch_main,
    },
    AnchorPatch {
        id: "client-settings-self-path",
        description: "add the SelfPath field to the shared client settings",
        relative_path: CLIENT_FILE,
        markers: &["SelfPath"],
        transform: patch_client_settings,
    },
    AnchorPatch {
        id: "link-self-path-flag",
        description: "add the self-path flag to the link command's help and parsing",
        relative_path: LINK_FILE,
        markers: &["self-path", "SelfPath"],
        transform: patch_link,
    },
    AnchorPatch {
        id: "buildmanager-self-path",
        description: "thread SelfPath through build config, ldflags and injected vars",
        relative_path: BUILDMANAGER_FILE,
        markers: &["SelfPath", "main.selfPath"],
        transform: patch_buildmanager,
    },
];

// --- detach.go -------------------------------------------------------------

/// Imports the installed helpers rely on.
const DETACH_IMPORTS: [&str; 6] = ["fmt", "os", "os/exec", "path/filepath", "strconv", "strings"];

const DETACH_RUN_ANCHOR: &str = "func Run(settings *client.Settings) {";

const DETACH_HELPERS: &str = concat!(
    "func normalizeSelfPath(path string) string {\n",
    "\tif path == \"\" {\n",
    "\t\treturn \"\"\n",
    "\t}\n",
    "\n",
    "\tif unquoted, err := strconv.Unquote(path); err == nil {\n",
    "\t\tpath = unquoted\n",
    "\t} else {\n",
    "\t\tpath = strings.Trim(path, \"\\\"'\")\n",
    "\t}\n",
    "\n",
    "\treturn path\n",
    "}\n",
    "\n",
    "func isProcPath(path string) bool {\n",
    "\treturn strings.HasPrefix(path, \"/proc/\")\n",
    "}\n",
    "\n",
    "func selfExecCandidates(settings *client.Settings) []string {\n",
    "\tcandidates := make([]string, 0, 4)\n",
    "\tseen := make(map[string]bool)\n",
    "\tadd := func(path string) {\n",
    "\t\tpath = normalizeSelfPath(path)\n",
    "\t\tif path == \"\" || seen[path] {\n",
    "\t\t\treturn\n",
    "\t\t}\n",
    "\t\tif isProcPath(path) {\n",
    "\t\t\treturn\n",
    "\t\t}\n",
    "\t\tseen[path] = true\n",
    "\t\tcandidates = append(candidates, path)\n",
    "\t}\n",
    "\n",
    "\tif settings != nil && settings.SelfPath != \"\" {\n",
    "\t\tadd(settings.SelfPath)\n",
    "\t}\n",
    "\n",
    "\tif len(os.Args) > 0 && os.Args[0] != \"\" {\n",
    "\t\tif p, err := exec.LookPath(os.Args[0]); err == nil {\n",
    "\t\t\tadd(p)\n",
    "\t\t\tif abs, err := filepath.Abs(p); err == nil {\n",
    "\t\t\t\tadd(abs)\n",
    "\t\t\t}\n",
    "\t\t}\n",
    "\n",
    "\t\tif abs, err := filepath.Abs(os.Args[0]); err == nil {\n",
    "\t\t\tadd(abs)\n",
    "\t\t}\n",
    "\t}\n",
    "\n",
    "\tif p, err := os.Executable(); err == nil {\n",
    "\t\tadd(p)\n",
    "\t}\n",
    "\n",
    "\treturn candidates\n",
    "}\n",
    "\n",
);

const DETACH_FORK: &str = concat!(
    "func Fork(settings *client.Settings, pretendArgv ...string) error {\n",
    "\n",
    "\tlog.Println(\"Forking\")\n",
    "\n",
    "\tcandidates := selfExecCandidates(settings)\n",
    "\tif len(candidates) == 0 {\n",
    "\t\treturn fmt.Errorf(\"unable to resolve self path for re-exec\")\n",
    "\t}\n",
    "\n",
    "\tvar lastErr error\n",
    "\tfor _, candidate := range candidates {\n",
    "\t\terr := fork(candidate, nil, pretendArgv...)\n",
    "\t\tif err == nil {\n",
    "\t\t\treturn nil\n",
    "\t\t}\n",
    "\n",
    "\t\tlog.Println(\"Forking from\", candidate, \"failed:\", err)\n",
    "\t\tlastErr = err\n",
    "\t}\n",
    "\n",
    "\treturn lastErr\n",
    "}",
);

static FORK_FN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)func Fork\(settings \*client\.Settings, pretendArgv \.\.\.string\) error \{.*?\n\}",
    )
    .expect("Fork pattern is a valid regex")
});

fn patch_detach(content: &str) -> Result<String, TransformError> {
    let content = ensure_detach_imports(content)?;

    let with_helpers = {
        let mut replacement = String::with_capacity(DETACH_HELPERS.len() + DETACH_RUN_ANCHOR.len());
        replacement.push_str(DETACH_HELPERS);
        replacement.push_str(DETACH_RUN_ANCHOR);
        replace_once(&content, DETACH_RUN_ANCHOR, &replacement, "Run")?
    };

    if !FORK_FN.is_match(&with_helpers) {
        return Err(TransformError::Missing {
            anchor: "Fork function",
        });
    }
    Ok(FORK_FN
        .replace(&with_helpers, regex::NoExpand(DETACH_FORK))
        .into_owned())
}

/// Make sure the import block carries everything the helpers reference.
///
/// Missing names are inserted after the `path/filepath` import when one
/// exists, otherwise just before the closing parenthesis, reusing the
/// block's own indentation.
fn ensure_detach_imports(content: &str) -> Result<String, TransformError> {
    let start = content.find("import (").ok_or(TransformError::Missing {
        anchor: "import block",
    })?;
    let end = content[start..]
        .find(")\n")
        .map(|offset| start + offset + 2)
        .ok_or(TransformError::Missing {
            anchor: "import block end",
        })?;

    let block = &content[start..end];
    let mut lines: Vec<String> = block.lines().map(str::to_owned).collect();
    if lines.len() < 2 {
        return Err(TransformError::Missing {
            anchor: "import block",
        });
    }

    let indent = lines[1..lines.len() - 1]
        .iter()
        .find(|line| !line.trim().is_empty())
        .map(|line| line[..line.len() - line.trim_start().len()].to_owned())
        .unwrap_or_else(|| "\t".to_owned());

    for name in DETACH_IMPORTS {
        let present = lines[1..lines.len() - 1]
            .iter()
            .any(|line| line.trim().trim_matches('"') == name);
        if present {
            continue;
        }

        let insert_at = lines
            .iter()
            .position(|line| line.trim().trim_matches('"') == "path/filepath")
            .map(|idx| idx + 1)
            .unwrap_or(lines.len() - 1);
        lines.insert(insert_at, format!("{indent}\"{name}\""));
    }

    let mut new_block = lines.join("\n");
    new_block.push('\n');
    if new_block == block {
        return Ok(content.to_owned());
    }

    let mut out = String::with_capacity(content.len() + new_block.len() - block.len());
    out.push_str(&content[..start]);
    out.push_str(&new_block);
    out.push_str(&content[end..]);
    Ok(out)
}

// --- main.go ---------------------------------------------------------------

const MAIN_USAGE_OLD: &str = "--[foreground|fingerprint|proxy|process_name]";
const MAIN_USAGE_NEW: &str = "--[foreground|fingerprint|proxy|process_name|self-path]";

/// Matches the `--sni` help line in the Go source, where `\t` is a literal
/// escape sequence inside the Go string, not a tab.
const MAIN_SNI_HELP_MARKER: &str = "--sni\\tWhen using TLS";
const MAIN_HELP_LINE: &str = "\tfmt.Println(\"\\t\\t--self-path\\tExplicit path to the client binary for re-exec on daemonize\")";

const MAIN_VAR_ANCHOR: &str = "\tcustomSNI   string\n";
const MAIN_VAR_INSERT: &str = "\tselfPath    string\n";
const MAIN_VAR_WITH_INSERT: &str = concat!("\tcustomSNI   string\n", "\tselfPath    string\n");

const MAIN_SETTINGS_ANCHOR: &str = "\t\tSNI:                  customSNI,\n";
const MAIN_SETTINGS_WITH_INSERT: &str = concat!(
    "\t\tSNI:                  customSNI,\n",
    "\t\tSelfPath:             selfPath,\n",
);

const MAIN_PROXY_BLOCK: &str = concat!(
    "\tproxyaddress, _ := line.GetArgString(\"proxy\")\n",
    "\tif len(proxyaddress) > 0 {\n",
    "\t\tsettings.ProxyAddr = proxyaddress\n",
    "\t}\n",
);

const MAIN_PROXY_BLOCK_WITH_SELF: &str = concat!(
    "\tproxyaddress, _ := line.GetArgString(\"proxy\")\n",
    "\tif len(proxyaddress) > 0 {\n",
    "\t\tsettings.ProxyAddr = proxyaddress\n",
    "\t}\n",
    "\n",
    "\tuserSpecifiedSelfPath, err := line.GetArgString(\"self-path\")\n",
    "\tif err == nil {\n",
    "\t\tsettings.SelfPath = userSpecifiedSelfPath\n",
    "\t}\n",
);

const GET_ARG_SELF_PATH: &str = "GetArgString(\"self-path\")";

/// Five sub-edits under one aggregate modified/unmodified signal. Each guard
/// checks for that sub-edit's own inserted fragment so a partially patched
/// file converges instead of wedging.
fn patch_main(content: &str) -> Result<String, TransformError> {
    let mut text = content.to_owned();

    if let Some(updated) = replace_if_present(&text, MAIN_USAGE_OLD, MAIN_USAGE_NEW) {
        text = updated;
    }

    if !text.contains("--self-path") {
        if let Some(updated) = insert_line_after(&text, MAIN_SNI_HELP_MARKER, MAIN_HELP_LINE) {
            text = updated;
        }
    }

    if !text.contains(MAIN_VAR_INSERT) {
        if let Some(updated) = replace_if_present(&text, MAIN_VAR_ANCHOR, MAIN_VAR_WITH_INSERT) {
            text = updated;
        }
    }

    if !text.contains("SelfPath:") {
        if let Some(updated) =
            replace_if_present(&text, MAIN_SETTINGS_ANCHOR, MAIN_SETTINGS_WITH_INSERT)
        {
            text = updated;
        }
    }

    if !text.contains(GET_ARG_SELF_PATH) {
        if let Some(updated) =
            replace_if_present(&text, MAIN_PROXY_BLOCK, MAIN_PROXY_BLOCK_WITH_SELF)
        {
            text = updated;
        }
    }

    Ok(text)
}

// --- client.go -------------------------------------------------------------

const CLIENT_SNI_FIELD: &str = "\tSNI         string\n";
const CLIENT_SELF_PATH_FIELD: &str = "\tSelfPath    string\n";

fn patch_client_settings(content: &str) -> Result<String, TransformError> {
    insert_after(content, CLIENT_SNI_FIELD, CLIENT_SELF_PATH_FIELD, "SNI field")
}

// --- link.go ---------------------------------------------------------------

const LINK_SNI_FLAG: &str =
    "\t\t\"sni\":               \"When TLS is in use, set a custom SNI for the client to connect with\",\n";

const LINK_SNI_FLAG_WITH_SELF: &str = concat!(
    "\t\t\"sni\":               \"When TLS is in use, set a custom SNI for the client to connect with\",\n",
    "\t\t\"self-path\":         \"Explicit path to the client binary for re-exec on daemonize\",\n",
);

const LINK_SNI_PARSE_BLOCK: &str = concat!(
    "\tbuildConfig.SNI, err = line.GetArgString(\"sni\")\n",
    "\tif err != nil && err != terminal.ErrFlagNotSet {\n",
    "\t\treturn err\n",
    "\t}\n",
);

const LINK_PARSE_BLOCK_WITH_SELF: &str = concat!(
    "\tbuildConfig.SNI, err = line.GetArgString(\"sni\")\n",
    "\tif err != nil && err != terminal.ErrFlagNotSet {\n",
    "\t\treturn err\n",
    "\t}\n",
    "\n",
    "\tbuildConfig.SelfPath, err = line.GetArgString(\"self-path\")\n",
    "\tif err != nil && err != terminal.ErrFlagNotSet {\n",
    "\t\treturn err\n",
    "\t}\n",
);

/// Two sub-edits mirroring the neighboring `sni` flag's structure. Guards
/// are per-fragment so both edits land in the same pass.
fn patch_link(content: &str) -> Result<String, TransformError> {
    let mut text = content.to_owned();

    if !text.contains("\"self-path\":") {
        if let Some(updated) = replace_if_present(&text, LINK_SNI_FLAG, LINK_SNI_FLAG_WITH_SELF) {
            text = updated;
        }
    }

    if !text.contains(GET_ARG_SELF_PATH) {
        if let Some(updated) =
            replace_if_present(&text, LINK_SNI_PARSE_BLOCK, LINK_PARSE_BLOCK_WITH_SELF)
        {
            text = updated;
        }
    }

    Ok(text)
}

// --- buildmanager.go -------------------------------------------------------

const BUILD_FIELD_ANCHOR: &str = "\tProxy, SNI, LogLevel string\n";
const BUILD_FIELD_WITH_SELF: &str =
    concat!("\tProxy, SNI, LogLevel string\n", "\tSelfPath string\n");

const BUILD_LDFLAG_OLD: &str = "-X main.customSNI=%s -X main.useHostKerberos=%t";
const BUILD_LDFLAG_NEW: &str = "-X main.customSNI=%s -X main.selfPath=%s -X main.useHostKerberos=%t";

const BUILD_ARGS_OLD: &str = "config.Proxy, config.SNI, config.UseKerberosAuth";
const BUILD_ARGS_NEW: &str = "config.Proxy, config.SNI, config.SelfPath, config.UseKerberosAuth";

/// Three independently idempotent sub-edits. Only the struct field is
/// mandatory: when neither the anchor line nor an existing field is present
/// the build config no longer matches and the run must stop.
fn patch_buildmanager(content: &str) -> Result<String, TransformError> {
    let mut text = content.to_owned();

    if !text.contains("\tSelfPath string") {
        match replace_if_present(&text, BUILD_FIELD_ANCHOR, BUILD_FIELD_WITH_SELF) {
            Some(updated) => text = updated,
            None if !text.contains("SelfPath") => {
                return Err(TransformError::Missing {
                    anchor: "Proxy/SNI/LogLevel fields",
                });
            }
            None => {}
        }
    }

    if !text.contains("main.selfPath") {
        if let Some(updated) = replace_if_present(&text, BUILD_LDFLAG_OLD, BUILD_LDFLAG_NEW) {
            text = updated;
        }
    }

    if !text.contains("config.SelfPath") {
        if let Some(updated) = replace_if_present(&text, BUILD_ARGS_OLD, BUILD_ARGS_NEW) {
            text = updated;
        }
    }

    Ok(text)
}
