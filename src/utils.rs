/// Formats bytes as lowercase hexadecimal pairs separated by spaces.
pub(crate) fn format_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_string();
    }

    let encoded = hex::encode(bytes);
    let mut rendered = String::with_capacity(bytes.len().saturating_mul(3));
    for (index, pair) in encoded.as_bytes().chunks(2).enumerate() {
        if index > 0 {
            rendered.push(' ');
        }
        rendered.extend(pair.iter().map(|digit| char::from(*digit)));
    }
    rendered
}

/// Formats an optional RSSI for terminal output.
pub(crate) fn format_rssi(rssi: Option<i16>) -> String {
    match rssi {
        Some(value) => format!("{value} dBm"),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(&[], "<empty>")]
    #[case(&[0x0f, 0x01, 0x01], "0f 01 01")]
    #[case(&[0x1f, 0xff], "1f ff")]
    #[case(&[0xab], "ab")]
    #[case(&[0x00, 0xa1, 0x05, 0xff], "00 a1 05 ff")]
    fn format_hex_renders_pairs(#[case] bytes: &[u8], #[case] expected: &str) {
        assert_eq!(expected, format_hex(bytes));
    }

    #[rstest]
    #[case(None, "-")]
    #[case(Some(-50), "-50 dBm")]
    fn format_rssi_renders_unknown_and_known(#[case] rssi: Option<i16>, #[case] expected: &str) {
        assert_eq!(expected, format_rssi(rssi));
    }
}
