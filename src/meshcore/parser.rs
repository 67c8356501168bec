//! Parsers for meshcore-cli's human-readable command output.

use serde::{Deserialize, Serialize};

/// A contact waiting for manual approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingContact {
    pub name: String,
    pub public_key: String,
}

/// A configured channel slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub index: u8,
    pub name: String,
    #[serde(default)]
    pub key: String,
}

/// Parse `pending_contacts` output.
///
/// Each entry is `<name>: <hex key>`; the key may be split into groups by
/// spaces, which are removed. Lines without a colon (headers, blank lines)
/// are skipped, as are entries with an empty name or key.
pub fn parse_pending_contacts(stdout: &str) -> Vec<PendingContact> {
    stdout
        .lines()
        .filter_map(|line| {
            let (name, key) = line.split_once(':')?;
            let name = name.trim();
            let public_key: String = key.chars().filter(|c| !c.is_whitespace()).collect();
            if name.is_empty() || public_key.is_empty() {
                return None;
            }
            Some(PendingContact {
                name: name.to_string(),
                public_key,
            })
        })
        .collect()
}

/// Parse `get_channels` output: `<index>: <name> [<hex key>]`, key optional.
///
/// Slots without a name are unconfigured and left out.
pub fn parse_channels(stdout: &str) -> Vec<Channel> {
    let mut channels: Vec<Channel> = stdout
        .lines()
        .filter_map(|line| {
            let (index, rest) = line.split_once(':')?;
            let index: u8 = index.trim().parse().ok()?;
            let rest = rest.trim();
            let (name, key) = match (rest.rfind('['), rest.ends_with(']')) {
                (Some(open), true) => (
                    rest[..open].trim(),
                    rest[open + 1..rest.len() - 1].trim(),
                ),
                _ => (rest, ""),
            };
            if name.is_empty() {
                return None;
            }
            Some(Channel {
                index,
                name: name.to_string(),
                key: key.to_string(),
            })
        })
        .collect();
    channels.sort_by_key(|c| c.index);
    channels.dedup_by_key(|c| c.index);
    channels
}

/// Join argument words into one CLI command line.
///
/// Words containing whitespace or quotes (and empty words) are wrapped in
/// double quotes with `"` and `\` escaped.
pub fn format_command<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| {
            let arg = arg.as_ref();
            if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
                return arg.to_string();
            }
            let mut quoted = String::with_capacity(arg.len() + 2);
            quoted.push('"');
            for c in arg.chars() {
                if c == '"' || c == '\\' {
                    quoted.push('\\');
                }
                quoted.push(c);
            }
            quoted.push('"');
            quoted
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_contact_key_spaces_are_stripped() {
        let parsed = parse_pending_contacts("Skyllancer: f9ef 123abc");
        assert_eq!(
            parsed,
            vec![PendingContact {
                name: "Skyllancer".into(),
                public_key: "f9ef123abc".into()
            }]
        );
    }

    #[test]
    fn lines_without_colon_are_skipped() {
        let out = "Pending contacts\nAlpha: aa bb\nno colon here\n\nBeta:cc\n";
        let names: Vec<_> = parse_pending_contacts(out)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "Beta"]);
    }

    #[test]
    fn empty_output_yields_no_contacts() {
        assert!(parse_pending_contacts("").is_empty());
    }

    #[test]
    fn channels_with_and_without_keys() {
        let out = "0: Public [8b3387e9c5cdea6ac9e5edbaa115cd72]\n1: hiking\n2: \nbanner line\n";
        let channels = parse_channels(out);
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].name, "Public");
        assert_eq!(channels[0].key, "8b3387e9c5cdea6ac9e5edbaa115cd72");
        assert_eq!(channels[1].index, 1);
        assert_eq!(channels[1].name, "hiking");
        assert_eq!(channels[1].key, "");
    }

    #[test]
    fn format_command_quotes_words_with_spaces() {
        assert_eq!(format_command(&["infos"]), "infos");
        assert_eq!(
            format_command(&["chan", "0", "hello mesh"]),
            "chan 0 \"hello mesh\""
        );
        assert_eq!(format_command(&["say", "a \"b\""]), "say \"a \\\"b\\\"\"");
        assert_eq!(format_command(&["x", ""]), "x \"\"");
    }
}
