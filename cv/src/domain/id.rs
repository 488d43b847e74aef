//! Run and artifact identifiers
//!
//! Generated ids use the format `{6-char-hex}-{kind}-{slug}`,
//! e.g. `019a3c-run-add-oauth-login`.

/// Longest slug kept in a generated id
const MAX_SLUG_LEN: usize = 40;

/// Generate a time-ordered id of the given kind from free text
pub fn generate_id(kind: &str, text: &str) -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    let slug = slugify(text);
    if slug.is_empty() {
        format!("{}-{}", &uuid[..6], kind)
    } else {
        format!("{}-{}-{}", &uuid[..6], kind, slug)
    }
}

/// Lowercase, hyphen-separated slug, apostrophes dropped, length capped
pub fn slugify(text: &str) -> String {
    let slug = text
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            c if c.is_alphanumeric() => Some(c),
            '\'' | '\u{2019}' | '\u{2018}' => None,
            _ => Some('-'),
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    if slug.chars().count() <= MAX_SLUG_LEN {
        return slug;
    }
    let cut: String = slug.chars().take(MAX_SLUG_LEN).collect();
    cut.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add OAuth login"), "add-oauth-login");
        assert_eq!(slugify("  spaces   everywhere "), "spaces-everywhere");
        assert_eq!(slugify("Don't panic"), "dont-panic");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn test_slugify_caps_length() {
        let slug = slugify(&"word ".repeat(30));
        assert!(slug.chars().count() <= MAX_SLUG_LEN);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn test_generate_id_format() {
        let id = generate_id("run", "Build a CLI");
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0].len(), 6);
        assert_eq!(parts[1], "run");
        assert_eq!(parts[2], "build-a-cli");
    }

    #[test]
    fn test_generate_id_empty_slug() {
        let id = generate_id("run", "???");
        assert!(id.ends_with("-run"));
    }
}
