//! Shell sandbox.
//!
//! Pre-flight validator for commands headed to a terminal PTY. Purely
//! syntactic — nothing is executed to decide. Two layers:
//!
//! 1. deny list — always blocked regardless of paths
//! 2. write gate — commands that modify files are allowed only when every
//!    target path resolves under the writable root
//!
//! Commands are parsed conservatively; when the validator cannot tell a
//! command is safe, it blocks and returns a readable reason. Rejections
//! never fail the protocol write — they surface as a `SANDBOX BLOCKED:`
//! line in the terminal's `stdout`.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub ok: bool,
    pub reason: Option<String>,
}

impl Verdict {
    fn allow() -> Self {
        Verdict {
            ok: true,
            reason: None,
        }
    }

    fn block(reason: impl Into<String>) -> Self {
        Verdict {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

static BLOCKED_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // Destructive
        "rm", "rmdir", "shred", "wipe",
        // Disk / partition
        "mkfs", "fdisk", "parted", "gdisk", "dd", "wipefs", "blkdiscard",
        // Privilege escalation
        "sudo", "su", "doas", "pkexec",
        // Ownership
        "chown", "chgrp",
        // System-level danger
        "reboot", "shutdown", "poweroff", "halt", "init", "systemctl", "service",
        "mount", "umount", "insmod", "rmmod", "modprobe",
        // Container / vm escape vectors
        "docker", "podman", "kubectl", "nsenter", "unshare", "chroot",
        // Package managers
        "apt", "apt-get", "dpkg", "yum", "dnf", "pacman", "npm", "cargo", "gem", "go",
    ]
    .into_iter()
    .collect()
});

static WRITE_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "cp", "mv", "install", "tee", "touch", "mkdir", "mktemp", "ln", "chmod", "truncate",
        "split", "csplit", "patch", "sed", "awk", "perl", "python", "python3", "tar", "unzip",
        "gzip", "bzip2", "xz", "zstd",
    ]
    .into_iter()
    .collect()
});

static READ_ONLY_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "cat", "ls", "dir", "ll", "head", "tail", "less", "more", "grep", "egrep", "fgrep",
        "rg", "ag", "find", "locate", "which", "whereis", "type", "wc", "sort", "uniq", "cut",
        "paste", "column", "tr", "comm", "diff", "cmp", "md5sum", "sha256sum", "sha1sum",
        "file", "stat", "du", "df", "hexdump", "xxd", "od", "strings", "date", "cal", "uptime",
        "uname", "hostname", "whoami", "id", "env", "printenv", "echo", "printf", "ps", "top",
        "htop", "free", "lsof", "tree", "realpath", "basename", "dirname", "readlink", "jq",
        "yq", "man", "help", "info", "true", "false", "test", "[", "seq", "yes", "sleep",
        "wait", "xargs", "tput", "clear", "reset",
    ]
    .into_iter()
    .collect()
});

/// Read commands whose non-flag arguments are file paths to read.
static FILE_READING_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "cat", "head", "tail", "less", "more", "grep", "egrep", "fgrep", "rg", "ag", "wc",
        "sort", "uniq", "cut", "paste", "column", "comm", "diff", "cmp", "md5sum", "sha256sum",
        "sha1sum", "file", "stat", "hexdump", "xxd", "od", "strings", "jq", "yq",
    ]
    .into_iter()
    .collect()
});

/// `> /path`, `>> /path`, `2> /path`, `&> /path` targets.
static REDIRECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\\>])(?:[012]?>{1,2}|&>>?)\s*([^\s;|&]+)").unwrap());

/// Shell constructs that embed arbitrary code and resist static analysis.
static SHELL_ESCAPES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"\beval\b").unwrap(),
            "eval can execute arbitrary code",
        ),
        (
            Regex::new(r"\b(?:ba)?sh\s+-c\b").unwrap(),
            "sh -c can execute arbitrary code",
        ),
        (
            Regex::new(r"\bzsh\s+-c\b").unwrap(),
            "zsh -c can execute arbitrary code",
        ),
        (
            Regex::new(r">\(").unwrap(),
            "process substitution writes are not allowed",
        ),
        (
            Regex::new(r"\bpython[23]?\s+-c\b").unwrap(),
            "python -c can execute arbitrary code",
        ),
        (
            Regex::new(r"\bperl\s+-e\b").unwrap(),
            "perl -e can execute arbitrary code",
        ),
        (
            Regex::new(r"\bruby\s+-e\b").unwrap(),
            "ruby -e can execute arbitrary code",
        ),
        (
            Regex::new(r"\bnode\s+-e\b").unwrap(),
            "node -e can execute arbitrary code",
        ),
        (Regex::new(r":\(\)\s*\{").unwrap(), "fork bomb"),
    ]
});

/// ALL-CAPS basenames under the writable root are agent outputs; the
/// sandbox treats them as write-only.
static PROTECTED_BASENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").unwrap());

static VAR_ASSIGN_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=\S*\s+").unwrap());

pub struct Sandbox {
    writable_root: String,
    enabled: bool,
}

impl Sandbox {
    pub fn new(writable_root: impl Into<String>, enabled: bool) -> Self {
        let sandbox = Self {
            writable_root: {
                let mut root = writable_root.into();
                while root.len() > 1 && root.ends_with('/') {
                    root.pop();
                }
                root
            },
            enabled,
        };
        if !sandbox.enabled {
            warn!("shell sandbox DISABLED — permissive fallback, all commands pass");
        }
        sandbox
    }

    /// Validate a command. Idempotent and total: same input, same verdict.
    pub fn check(&self, command: &str) -> Verdict {
        if !self.enabled {
            return Verdict::allow();
        }
        let command = command.trim();
        if command.is_empty() {
            return Verdict::allow();
        }

        for (pattern, reason) in SHELL_ESCAPES.iter() {
            if pattern.is_match(command) {
                return Verdict::block(*reason);
            }
        }

        for target in extract_redirect_targets(command) {
            if !self.path_is_writable(&target) {
                return Verdict::block(format!(
                    "write redirect to '{target}' is outside writable directories"
                ));
            }
        }

        for segment in split_segments(command) {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let verdict = self.check_single(segment);
            if !verdict.ok {
                return verdict;
            }
        }

        Verdict::allow()
    }

    fn path_is_writable(&self, path: &str) -> bool {
        let norm = normalize_path(path);
        norm == self.writable_root || norm.starts_with(&format!("{}/", self.writable_root))
    }

    fn is_protected_read_path(&self, path: &str) -> bool {
        let norm = normalize_path(path);
        if !(norm == self.writable_root || norm.starts_with(&format!("{}/", self.writable_root))) {
            return false;
        }
        let basename = norm.rsplit('/').next().unwrap_or("");
        PROTECTED_BASENAME_RE.is_match(basename)
    }

    fn check_single(&self, segment: &str) -> Verdict {
        // Strip leading FOO=bar environment prefixes.
        let mut segment = segment.to_string();
        while VAR_ASSIGN_PREFIX_RE.is_match(&segment) {
            segment = VAR_ASSIGN_PREFIX_RE.replace(&segment, "").trim().to_string();
        }
        if segment.is_empty() {
            return Verdict::allow();
        }

        let tokens = match tokenize(&segment) {
            Some(tokens) => tokens,
            None => return Verdict::block("could not parse command (unbalanced quotes)"),
        };
        if tokens.is_empty() {
            return Verdict::allow();
        }

        let base = base_command(&tokens[0]);

        if BLOCKED_COMMANDS.contains(base.as_str()) {
            return Verdict::block(format!("'{base}' is not allowed"));
        }

        if READ_ONLY_COMMANDS.contains(base.as_str()) {
            if FILE_READING_COMMANDS.contains(base.as_str()) {
                for token in &tokens[1..] {
                    if token.starts_with('-') {
                        continue;
                    }
                    if self.is_protected_read_path(token) {
                        return Verdict::block(format!(
                            "reading '{token}' is not allowed (ALL-CAPS files under {} are protected)",
                            self.writable_root
                        ));
                    }
                }
            }
            return Verdict::allow();
        }

        if base == "tee" {
            for target in tokens[1..].iter().filter(|t| !t.starts_with('-')) {
                if !self.path_is_writable(target) {
                    return Verdict::block(format!(
                        "'tee' target '{target}' is outside writable directories"
                    ));
                }
            }
            return Verdict::allow();
        }

        if WRITE_COMMANDS.contains(base.as_str()) {
            return self.check_write_command(&base, &tokens);
        }

        // Unknown commands without offending redirects are likely reads.
        Verdict::allow()
    }

    fn check_write_command(&self, cmd: &str, tokens: &[String]) -> Verdict {
        let non_flag: Vec<&String> = tokens[1..].iter().filter(|t| !t.starts_with('-')).collect();

        match cmd {
            "cp" | "install" => {
                if tokens.len() < 3 {
                    return Verdict::allow();
                }
                let dest = tokens.last().unwrap();
                if !self.path_is_writable(dest) {
                    return Verdict::block(format!(
                        "'{cmd}' destination '{dest}' is outside writable directories"
                    ));
                }
                Verdict::allow()
            }
            "mv" => {
                if tokens.len() < 3 {
                    return Verdict::allow();
                }
                let dest = tokens.last().unwrap();
                for src in tokens[1..tokens.len() - 1].iter().filter(|t| !t.starts_with('-')) {
                    if !self.path_is_writable(src) {
                        return Verdict::block(format!(
                            "'mv' source '{src}' is outside writable directories (would delete it)"
                        ));
                    }
                }
                if !self.path_is_writable(dest) {
                    return Verdict::block(format!(
                        "'mv' destination '{dest}' is outside writable directories"
                    ));
                }
                Verdict::allow()
            }
            "touch" | "mkdir" | "mktemp" | "split" | "csplit" | "patch" => {
                for target in &non_flag {
                    if !self.path_is_writable(target) {
                        return Verdict::block(format!(
                            "'{cmd}' target '{target}' is outside writable directories"
                        ));
                    }
                }
                Verdict::allow()
            }
            "sed" | "awk" | "perl" => {
                // Only in-place editing writes; without -i the output goes
                // to stdout, which the redirect layer already checked.
                if tokens.iter().any(|t| t == "-i" || t.starts_with("-i")) {
                    for target in non_flag.iter().filter(|t| t.contains('/')) {
                        if !self.path_is_writable(target) {
                            return Verdict::block(format!(
                                "'{cmd} -i' on '{target}' is outside writable directories"
                            ));
                        }
                    }
                }
                Verdict::allow()
            }
            "truncate" => {
                let mut skip_next = false;
                for token in &tokens[1..] {
                    if skip_next {
                        skip_next = false;
                        continue;
                    }
                    if token == "-s" || token == "--size" {
                        skip_next = true;
                        continue;
                    }
                    if token.starts_with('-') {
                        continue;
                    }
                    if !self.path_is_writable(token) {
                        return Verdict::block(format!(
                            "'truncate' target '{token}' is outside writable directories"
                        ));
                    }
                }
                Verdict::allow()
            }
            "chmod" => {
                static MODE_RE: Lazy<Regex> =
                    Lazy::new(|| Regex::new(r"^([0-7]+|[ugoa])").unwrap());
                for target in non_flag.iter().filter(|t| !MODE_RE.is_match(t)) {
                    if !self.path_is_writable(target) {
                        return Verdict::block(format!(
                            "'chmod' target '{target}' is outside writable directories"
                        ));
                    }
                }
                Verdict::allow()
            }
            "ln" => {
                if tokens.len() < 3 {
                    return Verdict::allow();
                }
                let dest = tokens.last().unwrap();
                if !self.path_is_writable(dest) {
                    return Verdict::block(format!(
                        "'ln' target '{dest}' is outside writable directories"
                    ));
                }
                Verdict::allow()
            }
            "tar" => {
                let extracting = tokens.iter().any(|t| {
                    t == "--extract"
                        || (t.starts_with('-') && !t.starts_with("--") && t.contains('x'))
                });
                if extracting {
                    for (i, token) in tokens.iter().enumerate() {
                        if (token == "-C" || token == "--directory") && i + 1 < tokens.len() {
                            if !self.path_is_writable(&tokens[i + 1]) {
                                return Verdict::block(format!(
                                    "'tar -x -C {}' extracts outside writable directories",
                                    tokens[i + 1]
                                ));
                            }
                            return Verdict::allow();
                        }
                    }
                    return Verdict::block(
                        "tar extract without -C to a writable directory is not allowed (could write to cwd)",
                    );
                }
                Verdict::allow()
            }
            "unzip" => {
                for (i, token) in tokens.iter().enumerate() {
                    if token == "-d" && i + 1 < tokens.len() {
                        if !self.path_is_writable(&tokens[i + 1]) {
                            return Verdict::block(format!(
                                "'unzip -d {}' extracts outside writable directories",
                                tokens[i + 1]
                            ));
                        }
                        return Verdict::allow();
                    }
                }
                Verdict::block(
                    "unzip without -d to a writable directory is not allowed (could write to cwd)",
                )
            }
            "gzip" | "bzip2" | "xz" | "zstd" => {
                for target in &non_flag {
                    if !self.path_is_writable(target) {
                        return Verdict::block(format!(
                            "'{cmd}' on '{target}' is outside writable directories (in-place compression)"
                        ));
                    }
                }
                Verdict::allow()
            }
            "python" | "python3" => {
                if let Some(script) = non_flag.first() {
                    if !self.path_is_writable(script) {
                        return Verdict::block(format!(
                            "running Python script '{script}' outside writable directories is not allowed"
                        ));
                    }
                }
                Verdict::allow()
            }
            other => Verdict::block(format!(
                "'{other}' may write files — not allowed without writable directory targets"
            )),
        }
    }
}

/// Resolve a path string for policy checks. Handles `~`, relative paths and
/// `..` traversal without touching the filesystem (so `/n/../etc/shadow`
/// is caught even when nothing exists there).
fn normalize_path(path: &str) -> String {
    let path = path.trim_matches(|c| c == '\'' || c == '"');
    let mut expanded = if let Some(rest) = path.strip_prefix('~') {
        format!("/root{rest}")
    } else if !path.starts_with('/') {
        format!("/{path}")
    } else {
        path.to_string()
    };
    if expanded.is_empty() {
        expanded = "/".to_string();
    }

    let mut parts: Vec<&str> = Vec::new();
    for comp in expanded.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn extract_redirect_targets(command: &str) -> Vec<String> {
    REDIRECT_RE
        .captures_iter(command)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_matches(|c| c == '\'' || c == '"').to_string())
        .collect()
}

/// Split on unquoted `;`, `|`, `&&`, `||`. Simplified — handles basic
/// quoting, not every shell corner.
fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let chars: Vec<char> = command.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && !in_single && i + 1 < chars.len() {
            current.push(c);
            current.push(chars[i + 1]);
            i += 2;
            continue;
        }
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            ';' if !in_single && !in_double => {
                segments.push(std::mem::take(&mut current));
            }
            '|' if !in_single && !in_double => {
                segments.push(std::mem::take(&mut current));
                if i + 1 < chars.len() && chars[i + 1] == '|' {
                    i += 1;
                }
            }
            '&' if !in_single && !in_double && i + 1 < chars.len() && chars[i + 1] == '&' => {
                segments.push(std::mem::take(&mut current));
                i += 1;
            }
            _ => current.push(c),
        }
        i += 1;
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Quote-aware word splitting. Returns None on unbalanced quotes.
fn tokenize(segment: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = segment.chars().peekable();
    let mut has_content = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_content = true;
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                has_content = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_content = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_content {
                    tokens.push(std::mem::take(&mut current));
                    has_content = false;
                }
            }
            c => {
                current.push(c);
                has_content = true;
            }
        }
    }
    if in_single || in_double {
        return None;
    }
    if has_content {
        tokens.push(current);
    }
    Some(tokens)
}

/// `/usr/bin/rm` → `rm`, `mkfs.ext4` → `mkfs`.
fn base_command(token: &str) -> String {
    let name = token.rsplit('/').next().unwrap_or(token).to_lowercase();
    if let Some(prefix) = name.split('.').next() {
        if BLOCKED_COMMANDS.contains(prefix) {
            return prefix.to_string();
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> Sandbox {
        Sandbox::new("/n", true)
    }

    fn allowed(cmd: &str) -> bool {
        sandbox().check(cmd).ok
    }

    #[test]
    fn reads_are_unrestricted() {
        assert!(allowed("cat /etc/passwd"));
        assert!(allowed("ls -la /home"));
        assert!(allowed("grep -r TODO /src"));
        assert!(allowed("find / -name '*.py' -type f"));
        assert!(allowed("cat /src/main.rs | grep fn"));
    }

    #[test]
    fn writes_gated_to_mount_root() {
        assert!(allowed("echo hello > /n/llm/input"));
        assert!(allowed("mkdir -p /n/workspace/new"));
        assert!(allowed("touch /n/workspace/file.txt"));
        assert!(allowed("cp /etc/config /n/backup/config"));
        assert!(!allowed("echo pwned > /tmp/evil"));
        assert!(!allowed("cp /n/data /tmp/exfil"));
        assert!(!allowed("touch /var/tmp/x"));
        assert!(!allowed("echo data | tee /tmp/leak"));
    }

    #[test]
    fn destructive_commands_always_blocked() {
        assert!(!allowed("rm -rf /"));
        assert!(!allowed("rm /n/anything"));
        assert!(!allowed("dd if=/dev/zero of=/dev/sda"));
        assert!(!allowed("mkfs.ext4 /dev/sda1"));
        assert!(!allowed("sudo cat /etc/shadow"));
        assert!(!allowed("shutdown -h now"));
        assert!(!allowed("umount /n"));
        assert!(!allowed(":(){ :|:& };:"));
    }

    #[test]
    fn shell_escapes_blocked() {
        assert!(!allowed("bash -c 'rm -rf /'"));
        assert!(!allowed("eval 'rm -rf /'"));
        assert!(!allowed("python3 -c 'import os'"));
        assert!(!allowed("perl -e 'unlink \"/etc/passwd\"'"));
    }

    #[test]
    fn path_traversal_caught() {
        assert!(!allowed("echo x > /n/../etc/shadow"));
        assert!(allowed("echo x > /n/sub/../file"));
    }

    #[test]
    fn mv_checks_sources_too() {
        assert!(!allowed("mv /etc/passwd /n/steal"));
        assert!(allowed("mv /n/old /n/new"));
    }

    #[test]
    fn archive_extraction_needs_writable_dir() {
        assert!(!allowed("tar -xf archive.tar"));
        assert!(allowed("tar -xf archive.tar -C /n/workspace"));
        assert!(!allowed("unzip bundle.zip"));
        assert!(allowed("unzip bundle.zip -d /n/workspace"));
    }

    #[test]
    fn in_place_editing_gated() {
        assert!(!allowed("sed -i 's/root/pwned/' /etc/passwd"));
        assert!(allowed("sed 's/a/b/' /etc/passwd"));
        // Slash-free expressions dodge the conservative expression check.
        assert!(allowed("sed -i 5d /n/notes.txt"));
        assert!(!allowed("sed -i 5d /etc/passwd"));
    }

    #[test]
    fn protected_caps_files_are_write_only() {
        assert!(!allowed("cat /n/llm/agent/OUTPUT"));
        assert!(!allowed("head /n/llm/agent/CODE"));
        assert!(allowed("cat /n/llm/agent/output"));
        assert!(allowed("echo hello > /n/llm/agent/OUTPUT"));
        assert!(allowed("echo '/n/llm/a/CODE -> /n/rio/parse' > /n/rio/routes"));
    }

    #[test]
    fn unbalanced_quotes_blocked() {
        assert!(!allowed("echo 'unterminated"));
    }

    #[test]
    fn verdict_is_idempotent() {
        let s = sandbox();
        let cmd = "rm -rf /";
        assert_eq!(s.check(cmd), s.check(cmd));
        let cmd = "ls /n";
        assert_eq!(s.check(cmd), s.check(cmd));
    }

    #[test]
    fn disabled_sandbox_is_permissive() {
        let s = Sandbox::new("/n", false);
        assert!(s.check("rm -rf /").ok);
    }
}
