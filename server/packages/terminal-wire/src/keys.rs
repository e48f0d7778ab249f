use std::borrow::Cow;

/// Named keys and the byte sequence a terminal expects for each.
const KEY_TABLE: &[(&str, &str)] = &[
    ("enter", "\r"),
    ("return", "\r"),
    ("backspace", "\x7f"),
    ("tab", "\t"),
    ("escape", "\x1b"),
    ("esc", "\x1b"),
    ("up", "\x1b[A"),
    ("down", "\x1b[B"),
    ("right", "\x1b[C"),
    ("left", "\x1b[D"),
    ("home", "\x1b[H"),
    ("end", "\x1b[F"),
    ("delete", "\x1b[3~"),
    ("del", "\x1b[3~"),
    ("ctrl+c", "\x03"),
    ("ctrl+d", "\x04"),
    ("ctrl+l", "\x0c"),
];

fn normalize(name: &str) -> String {
    let lowered = name.trim().to_ascii_lowercase();
    let lowered = lowered
        .strip_prefix("arrow")
        .map(str::to_string)
        .unwrap_or(lowered);
    match lowered.strip_prefix("ctrl-") {
        Some(rest) => format!("ctrl+{rest}"),
        None => lowered,
    }
}

/// Returns the control sequence for a named key, if the name is known.
pub fn control_sequence(name: &str) -> Option<&'static str> {
    let normalized = normalize(name);
    KEY_TABLE
        .iter()
        .find(|(key, _)| *key == normalized)
        .map(|(_, sequence)| *sequence)
}

/// Bytes to send for `name`. Unknown names are sent as literal text.
pub fn key_bytes(name: &str) -> Cow<'_, [u8]> {
    match control_sequence(name) {
        Some(sequence) => Cow::Borrowed(sequence.as_bytes()),
        None => {
            tracing::debug!(key = name, "unmapped key name; sending as literal text");
            Cow::Borrowed(name.as_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_documented_keys() {
        assert_eq!(control_sequence("Enter"), Some("\r"));
        assert_eq!(control_sequence("Backspace"), Some("\x7f"));
        assert_eq!(control_sequence("Tab"), Some("\t"));
        assert_eq!(control_sequence("Escape"), Some("\x1b"));
        assert_eq!(control_sequence("ArrowUp"), Some("\x1b[A"));
        assert_eq!(control_sequence("ArrowDown"), Some("\x1b[B"));
        assert_eq!(control_sequence("ArrowRight"), Some("\x1b[C"));
        assert_eq!(control_sequence("ArrowLeft"), Some("\x1b[D"));
        assert_eq!(control_sequence("Home"), Some("\x1b[H"));
        assert_eq!(control_sequence("End"), Some("\x1b[F"));
        assert_eq!(control_sequence("Delete"), Some("\x1b[3~"));
        assert_eq!(control_sequence("Ctrl+C"), Some("\x03"));
        assert_eq!(control_sequence("Ctrl+D"), Some("\x04"));
        assert_eq!(control_sequence("Ctrl+L"), Some("\x0c"));
    }

    #[test]
    fn accepts_alternate_spellings() {
        assert_eq!(control_sequence("ctrl-c"), Some("\x03"));
        assert_eq!(control_sequence(" up "), Some("\x1b[A"));
        assert_eq!(control_sequence("ESC"), Some("\x1b"));
    }

    #[test]
    fn unknown_keys_pass_through_verbatim() {
        assert_eq!(control_sequence("Foo"), None);
        assert_eq!(key_bytes("Foo").as_ref(), b"Foo");
    }
}
