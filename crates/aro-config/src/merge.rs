//! Layer merging.

/// Recursively merge `overlay` into `base`.
///
/// Tables merge per key. Scalars and arrays from the overlay replace the
/// base value outright, so a user file listing `directories = ["a"]`
/// replaces the default list instead of appending to it.
pub fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                match base_table.get_mut(key) {
                    Some(base_val) => deep_merge(base_val, overlay_val),
                    None => {
                        base_table.insert(key.clone(), overlay_val.clone());
                    },
                }
            }
        },
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_merge_per_key() {
        let mut base: toml::Value = toml::from_str(
            r#"
            [subprocess]
            call_timeout_ms = 10
            handshake_timeout_ms = 20
            "#,
        )
        .unwrap();
        let overlay: toml::Value = toml::from_str("[subprocess]\ncall_timeout_ms = 99").unwrap();
        deep_merge(&mut base, &overlay);
        assert_eq!(base["subprocess"]["call_timeout_ms"].as_integer(), Some(99));
        assert_eq!(base["subprocess"]["handshake_timeout_ms"].as_integer(), Some(20));
    }

    #[test]
    fn test_arrays_replace() {
        let mut base: toml::Value = toml::from_str("dirs = [\"a\", \"b\"]").unwrap();
        let overlay: toml::Value = toml::from_str("dirs = [\"c\"]").unwrap();
        deep_merge(&mut base, &overlay);
        assert_eq!(base["dirs"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_new_keys_added() {
        let mut base: toml::Value = toml::from_str("[a]\nx = 1").unwrap();
        let overlay: toml::Value = toml::from_str("[b]\ny = 2").unwrap();
        deep_merge(&mut base, &overlay);
        assert_eq!(base["a"]["x"].as_integer(), Some(1));
        assert_eq!(base["b"]["y"].as_integer(), Some(2));
    }
}
