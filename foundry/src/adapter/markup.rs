//! Inline prosody markers.
//!
//! The voice adapter honours `[[pause:<ms>]]`, `[[rate:slow|fast]]`, and
//! `[[emph]]…[[/emph]]`; every other channel strips all `[[…]]` markers,
//! including foreign ones, before display.

/// The marker set this runtime emits and honours.
pub const PROSODY_MARKERS: &[&str] = &["pause", "rate", "emph"];

/// Removes every `[[…]]` marker. Unterminated markers are left as-is rather
/// than eating the rest of the line.
pub fn strip_prosody_markers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("[[") {
        let after = &rest[start + 2..];
        match after.find("]]") {
            Some(end) => {
                out.push_str(&rest[..start]);
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[..start + 2]);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Known and foreign markers are both stripped for chat.
    #[test]
    fn strips_known_and_foreign_markers() {
        let text = "Hello[[pause:300]] world[[rate:slow]]! [[vendor:x1]]Done.";
        assert_eq!(strip_prosody_markers(text), "Hello world! Done.");
    }

    /// **Scenario**: Emphasis spans strip to their inner text.
    #[test]
    fn emphasis_span() {
        assert_eq!(
            strip_prosody_markers("This is [[emph]]important[[/emph]]."),
            "This is important."
        );
    }

    /// **Scenario**: An unterminated marker is preserved.
    #[test]
    fn unterminated_marker_preserved() {
        assert_eq!(strip_prosody_markers("odd [[pause:99"), "odd [[pause:99");
    }
}
