//! Platform-parametric shell helpers used to build remote commands.

use super::Platform;

/// Quote `arg` as one word for the target shell.
///
/// Unix: single quotes, embedded `'` as `'\''`.
/// Windows (`cmd`): double quotes, embedded `"` doubled.
pub fn quote(arg: &str, platform: Platform) -> String {
    match platform {
        Platform::Unix => {
            if !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+".contains(c))
            {
                return arg.to_string();
            }
            format!("'{}'", arg.replace('\'', r"'\''"))
        }
        Platform::Windows => format!("\"{}\"", arg.replace('"', "\"\"")),
    }
}

/// Quote a path, leaving a leading `~/` unquoted so the shell expands it.
pub fn quote_path(path: &str, platform: Platform) -> String {
    match (platform, path.strip_prefix("~/")) {
        (Platform::Unix, Some(rest)) if !rest.is_empty() => {
            format!("~/{}", quote(rest, platform))
        }
        _ => quote(path, platform),
    }
}

/// Join path segments with the target's separator.
pub fn join_path(platform: Platform, base: &str, segments: &[&str]) -> String {
    let sep = separator(platform);
    let mut out = base.trim_end_matches(['/', '\\']).to_string();
    for segment in segments {
        let segment = segment.trim_matches(['/', '\\']);
        if segment.is_empty() {
            continue;
        }
        out.push(sep);
        out.push_str(segment);
    }
    out
}

pub fn separator(platform: Platform) -> char {
    match platform {
        Platform::Unix => '/',
        Platform::Windows => '\\',
    }
}

/// `cd <dir> && <command>` for the target shell.
pub fn cd_and(platform: Platform, dir: &str, command: &str) -> String {
    match platform {
        Platform::Unix => format!("cd {} && {command}", quote_path(dir, platform)),
        Platform::Windows => format!("cd /d {} && {command}", quote(dir, platform)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_quoting() {
        assert_eq!(quote("main", Platform::Unix), "main");
        assert_eq!(quote("task/abc", Platform::Unix), "task/abc");
        assert_eq!(quote("fix the bug", Platform::Unix), "'fix the bug'");
        assert_eq!(quote("it's", Platform::Unix), r"'it'\''s'");
        assert_eq!(quote("", Platform::Unix), "''");
        assert_eq!(quote("$(rm -rf /)", Platform::Unix), "'$(rm -rf /)'");
    }

    #[test]
    fn windows_quoting() {
        assert_eq!(quote("main", Platform::Windows), "\"main\"");
        assert_eq!(quote("say \"hi\"", Platform::Windows), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn tilde_paths_stay_expandable() {
        assert_eq!(
            quote_path("~/itachi/my repo", Platform::Unix),
            "~/'itachi/my repo'"
        );
        assert_eq!(quote_path("/srv/repo", Platform::Unix), "/srv/repo");
    }

    #[test]
    fn join_uses_platform_separator() {
        assert_eq!(
            join_path(Platform::Unix, "~/itachi/", &["proj", "..", "workspaces"]),
            "~/itachi/proj/../workspaces"
        );
        assert_eq!(
            join_path(Platform::Windows, r"C:\itachi", &["proj", "..", "workspaces"]),
            r"C:\itachi\proj\..\workspaces"
        );
    }

    #[test]
    fn cd_and_per_platform() {
        assert_eq!(cd_and(Platform::Unix, "/srv/a b", "ls"), "cd '/srv/a b' && ls");
        assert_eq!(
            cd_and(Platform::Windows, r"C:\w", "dir"),
            "cd /d \"C:\\w\" && dir"
        );
    }
}
