pub const MAX_SSID_BYTES: usize = 32;

pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Printable form of a raw SSID from a scan result. Stops at the first NUL
/// and replaces control bytes with `?`.
pub fn sanitize_ssid(raw: &[u8]) -> String {
    let cleaned: Vec<u8> = raw
        .iter()
        .take(MAX_SSID_BYTES)
        .take_while(|byte| **byte != 0)
        .map(|byte| match byte {
            0x00..=0x1f | 0x7f => b'?',
            other => *other,
        })
        .collect();
    String::from_utf8_lossy(&cleaned).into_owned()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn escapes_markup() {
        assert_eq!(
            escape(r#"<script>alert("x & 'y'")</script>"#),
            "&lt;script&gt;alert(&quot;x &amp; &#39;y&#39;&quot;)&lt;/script&gt;"
        );
        assert_eq!(escape(""), "");
        assert_eq!(escape("acme/widget"), "acme/widget");
    }

    #[test]
    fn ssid_control_bytes_become_question_marks() {
        assert_eq!(sanitize_ssid(&[b'A', b'\n', b'B', 0, b'C']), "A?B");
        assert_eq!(sanitize_ssid(&[0x7f, b'x']), "?x");
        assert_eq!(sanitize_ssid(&[b'z'; 40]).len(), MAX_SSID_BYTES);
    }
}
