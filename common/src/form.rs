//! `application/x-www-form-urlencoded` bodies from the configuration pages.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    /// `None` for `name` or `name=`.
    pub value: Option<String>,
}

pub fn parse(body: &str) -> Vec<FormField> {
    body.split('&')
        .filter_map(|pair| {
            let (name, value) = match pair.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (pair, None),
            };
            if name.is_empty() {
                return None;
            }
            Some(FormField {
                name: unescape(name),
                value: value.filter(|value| !value.is_empty()).map(unescape),
            })
        })
        .collect()
}

pub fn find<'a>(fields: &'a [FormField], name: &str) -> Option<&'a FormField> {
    fields.iter().find(|field| field.name == name)
}

/// Value of `name`, empty when present without one.
pub fn value<'a>(fields: &'a [FormField], name: &str) -> Option<&'a str> {
    find(fields, name).map(|field| field.value.as_deref().unwrap_or(""))
}

/// `+` is a space and `%XX` a byte. Broken escapes stay as they are.
pub fn unescape(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'+' => {
                out.push(b' ');
                idx += 1;
            }
            b'%' => match (hex_digit(bytes.get(idx + 1)), hex_digit(bytes.get(idx + 2))) {
                (Some(high), Some(low)) => {
                    out.push(high << 4 | low);
                    idx += 3;
                }
                _ => {
                    out.push(b'%');
                    idx += 1;
                }
            },
            byte => {
                out.push(byte);
                idx += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(byte: Option<&u8>) -> Option<u8> {
    char::from(*byte?).to_digit(16).map(|digit| digit as u8)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decodes_plus_and_percent_escapes() {
        let fields = parse("repo=acme%2Fwidget&note=hello+world&pre=on");
        assert_eq!(value(&fields, "repo"), Some("acme/widget"));
        assert_eq!(value(&fields, "note"), Some("hello world"));
        assert_eq!(value(&fields, "pre"), Some("on"));
        assert_eq!(value(&fields, "missing"), None);
    }

    #[test]
    fn broken_escapes_are_kept_literally() {
        assert_eq!(unescape("100%"), "100%");
        assert_eq!(unescape("%zz%4"), "%zz%4");
        assert_eq!(unescape("%41%42"), "AB");
    }

    #[test]
    fn empty_names_are_skipped_and_values_optional() {
        let fields = parse("&=orphan&flag&empty=&&ssid=caf%C3%A9");
        assert_eq!(
            fields,
            vec![
                FormField {
                    name: "flag".to_string(),
                    value: None
                },
                FormField {
                    name: "empty".to_string(),
                    value: None
                },
                FormField {
                    name: "ssid".to_string(),
                    value: Some("café".to_string())
                },
            ]
        );
        assert_eq!(value(&fields, "flag"), Some(""));
    }
}
