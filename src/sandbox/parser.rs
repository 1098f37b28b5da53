//! Parser for the host tool's human-oriented sandbox listing.
//!
//! The listing is a three-column table (`NAME STATE VERSION`) whose header
//! and state words are localized and whose spacing depends on the longest
//! name. A leading `*` marks the default sandbox. Only the version column is
//! reliable, so rows are read as: optional marker, name, state words, version.

use tracing::debug;

use super::types::{Sandbox, SandboxStatus};

const RUNNING_WORDS: &[&str] = &[
    "running",
    "ausgeführt",
    "exécution",
    "ejecut",
    "execução",
    "esecuzione",
    "выполняется",
    "运行",
    "執行",
    "実行",
    "실행",
];

const STOPPED_WORDS: &[&str] = &[
    "stopped",
    "beendet",
    "arrêté",
    "detenido",
    "parado",
    "interrotto",
    "остановлен",
    "停止",
    "중지",
];

const INSTALLING_WORDS: &[&str] = &["install", "convert", "安装", "安裝", "インストール", "설치"];

/// Map a (possibly localized, possibly multi-word) state column to a status.
pub fn parse_state(state: &str) -> SandboxStatus {
    let lower = state.to_lowercase();
    if INSTALLING_WORDS.iter().any(|w| lower.contains(w)) {
        SandboxStatus::Installing
    } else if RUNNING_WORDS.iter().any(|w| lower.contains(w)) {
        SandboxStatus::Running
    } else if STOPPED_WORDS.iter().any(|w| lower.contains(w)) {
        SandboxStatus::Stopped
    } else {
        debug!(state, "Unrecognized sandbox state, treating as stopped");
        SandboxStatus::Stopped
    }
}

/// Parse one listing row. Headers, banners and malformed rows yield `None`.
pub fn parse_list_line(line: &str) -> Option<Sandbox> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let is_default = trimmed.starts_with('*');
    let rest = trimmed.trim_start_matches('*').trim();
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.len() < 3 {
        return None;
    }

    let version: u8 = tokens.last()?.parse().ok()?;
    let name = tokens[0];
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return None;
    }
    let state = tokens[1..tokens.len() - 1].join(" ");

    let mut sandbox = Sandbox::new(name, parse_state(&state), version);
    sandbox.is_default = is_default;
    Some(sandbox)
}

/// Parse a whole listing, skipping anything that is not a sandbox row.
pub fn parse_list_output(text: &str) -> Vec<Sandbox> {
    text.lines().filter_map(parse_list_line).collect()
}

/// Render sandboxes in the listing format. Used by the local backend.
pub fn render_list_output(sandboxes: &[Sandbox]) -> String {
    let width = sandboxes
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(4)
        .max(4)
        + 4;
    let mut out = format!("  {:<width$}{:<16}VERSION\n", "NAME", "STATE", width = width);
    for sb in sandboxes {
        let marker = if sb.is_default { '*' } else { ' ' };
        out.push_str(&format!(
            "{} {:<width$}{:<16}{}\n",
            marker,
            sb.name,
            sb.status.to_string(),
            sb.version,
            width = width
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Case {
        label: &'static str,
        input: &'static str,
        expected: &'static [(&'static str, SandboxStatus, u8, bool)],
    }

    const CASES: &[Case] = &[
        Case {
            label: "english",
            input: "  NAME                   STATE           VERSION\n\
                    * Ubuntu-22.04           Running         2\n\
                    \x20 docker-desktop         Stopped         2\n",
            expected: &[
                ("Ubuntu-22.04", SandboxStatus::Running, 2, true),
                ("docker-desktop", SandboxStatus::Stopped, 2, false),
            ],
        },
        Case {
            label: "german multi-word state",
            input: "  NAME      STATUS             VERSION\n\
                    * Debian    Wird ausgeführt    2\n\
                    \x20 Legacy    Beendet            1\n",
            expected: &[
                ("Debian", SandboxStatus::Running, 2, true),
                ("Legacy", SandboxStatus::Stopped, 1, false),
            ],
        },
        Case {
            label: "chinese",
            input: "  名称            状态           版本\n\
                    * Ubuntu          正在运行         2\n\
                    \x20 kali-linux      已停止           2\n",
            expected: &[
                ("Ubuntu", SandboxStatus::Running, 2, true),
                ("kali-linux", SandboxStatus::Stopped, 2, false),
            ],
        },
        Case {
            label: "korean state with inner space",
            input: "  NAME    STATE     VERSION\n* Ubuntu  실행 중   2\n",
            expected: &[("Ubuntu", SandboxStatus::Running, 2, true)],
        },
        Case {
            label: "installing and converting",
            input: "  NAME     STATE          VERSION\n\
                    \x20 Alpine   Installing     2\n\
                    \x20 Fedora   Converting     1\n",
            expected: &[
                ("Alpine", SandboxStatus::Installing, 2, false),
                ("Fedora", SandboxStatus::Installing, 1, false),
            ],
        },
        Case {
            label: "tight spacing and tabs",
            input: "NAME STATE VERSION\n*ubuntu-1\tStopped\t2\nopenSUSE.15 Running 2\r\n",
            expected: &[
                ("ubuntu-1", SandboxStatus::Stopped, 2, true),
                ("openSUSE.15", SandboxStatus::Running, 2, false),
            ],
        },
        Case {
            label: "malformed rows skipped",
            input: "Windows Subsystem for Linux has no installed distributions.\n\
                    garbage\n\
                    \x20 half Running\n\
                    \x20 bad$name Running 2\n\
                    \x20 ok Running x\n",
            expected: &[],
        },
    ];

    #[test]
    fn test_parse_list_output_table() {
        for case in CASES {
            let parsed = parse_list_output(case.input);
            assert_eq!(
                parsed.len(),
                case.expected.len(),
                "{}: unexpected row count {:?}",
                case.label,
                parsed
            );
            for (sb, (name, status, version, is_default)) in parsed.iter().zip(case.expected) {
                assert_eq!(sb.name, *name, "{}", case.label);
                assert_eq!(sb.status, *status, "{}: {}", case.label, name);
                assert_eq!(sb.version, *version, "{}: {}", case.label, name);
                assert_eq!(sb.is_default, *is_default, "{}: {}", case.label, name);
            }
        }
    }

    #[test]
    fn test_render_then_parse() {
        let mut a = Sandbox::new("ubuntu-1", SandboxStatus::Stopped, 2);
        a.is_default = true;
        let b = Sandbox::new("a-much-longer-sandbox-name", SandboxStatus::Running, 1);
        let text = render_list_output(&[a.clone(), b.clone()]);
        assert_eq!(parse_list_output(&text), vec![a, b]);
    }

    #[test]
    fn test_unknown_state_defaults_to_stopped() {
        assert_eq!(parse_state("Frobnicating"), SandboxStatus::Stopped);
    }
}
