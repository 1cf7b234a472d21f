//! `%`-separated string sequences
//!
//! Every field is followed by `%`. Inside a field a literal `\` is written
//! as `\\` and a literal `%` as `\%`. A backslash followed by anything else
//! is kept as-is. Fields are raw bytes: the master ships signatures and PEM
//! blobs through the same encoding.

/// Escape each field and terminate it with `%`
pub fn encode_sequence<S: AsRef<[u8]>>(fields: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for field in fields {
        for &b in field.as_ref() {
            match b {
                b'\\' => out.extend_from_slice(b"\\\\"),
                b'%' => out.extend_from_slice(b"\\%"),
                _ => out.push(b),
            }
        }
        out.push(b'%');
    }
    out
}

/// Split an encoded sequence back into its fields
///
/// A trailing field without a terminating `%` is still returned.
pub fn decode_sequence(data: &[u8]) -> Vec<Vec<u8>> {
    let mut fields = Vec::new();
    let mut current = Vec::new();
    let mut pending = false;
    let mut i = 0;

    while i < data.len() {
        pending = true;
        match data[i] {
            b'\\' => match data.get(i + 1) {
                Some(b'\\') => {
                    current.push(b'\\');
                    i += 1;
                }
                Some(b'%') => {
                    current.push(b'%');
                    i += 1;
                }
                _ => current.push(b'\\'),
            },
            b'%' => {
                fields.push(std::mem::take(&mut current));
                pending = false;
            }
            b => current.push(b),
        }
        i += 1;
    }

    if pending {
        fields.push(current);
    }
    fields
}
