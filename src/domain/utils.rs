use std::path::{Component, Path};

/// Check that a name from remote data is a single plain path component.
///
/// Names from the manifest are joined under the sandbox root, so anything
/// that could climb out of it (separators, `.`/`..`, absolute paths) is refused.
pub fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains('\0') || name.contains('\\') {
        return false;
    }

    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Lossy UTF-8 view of at most `max_bytes` bytes of `data`.
///
/// A multi-byte character cut by the limit becomes a replacement character
/// instead of failing the whole excerpt.
pub fn utf8_prefix(data: &[u8], max_bytes: usize) -> String {
    let end = data.len().min(max_bytes);
    String::from_utf8_lossy(&data[..end]).into_owned()
}
