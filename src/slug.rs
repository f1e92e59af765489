//! Guidebook slug rules.
//!
//! A slug is the host-facing URL segment of a guidebook: lowercase ASCII
//! letters, digits and hyphens, 3 to 50 characters long.

use regex::Regex;

pub const MIN_SLUG_LEN: usize = 3;
pub const MAX_SLUG_LEN: usize = 50;

const PAD_SUFFIX: &str = "guide";

lazy_static::lazy_static! {
    static ref SLUG_REGEX: Regex = Regex::new(r"^[a-z0-9-]+$").expect("valid slug regex");
}

/// Validate a slug, returning a user-facing error message when invalid.
pub fn validate_slug(slug: &str) -> Result<(), String> {
    if slug.is_empty() {
        return Err("슬러그를 입력해주세요".to_string());
    }
    if slug.len() < MIN_SLUG_LEN {
        return Err(format!("슬러그는 최소 {}자 이상이어야 합니다", MIN_SLUG_LEN));
    }
    if slug.len() > MAX_SLUG_LEN {
        return Err(format!("슬러그는 최대 {}자까지 가능합니다", MAX_SLUG_LEN));
    }
    if !SLUG_REGEX.is_match(slug) {
        return Err("슬러그는 영문 소문자, 숫자, 하이픈(-)만 사용할 수 있습니다".to_string());
    }
    Ok(())
}

pub fn is_valid_slug(slug: &str) -> bool {
    validate_slug(slug).is_ok()
}

/// Turn arbitrary input into a valid slug.
pub fn sanitize_slug(input: &str) -> String {
    let mut slug = String::with_capacity(input.len().min(MAX_SLUG_LEN));
    for c in input.chars().flat_map(char::to_lowercase) {
        let mapped = match c {
            'a'..='z' | '0'..='9' => Some(c),
            '-' | '_' | '.' | '/' => Some('-'),
            c if c.is_whitespace() => Some('-'),
            _ => None,
        };
        if let Some(c) = mapped {
            if c == '-' && (slug.is_empty() || slug.ends_with('-')) {
                continue;
            }
            slug.push(c);
        }
    }

    slug.truncate(MAX_SLUG_LEN);
    let trimmed = slug.trim_matches('-');
    let mut slug = trimmed.to_string();

    if slug.len() < MIN_SLUG_LEN {
        if slug.is_empty() {
            slug.push_str(PAD_SUFFIX);
        } else {
            slug.push('-');
            slug.push_str(PAD_SUFFIX);
        }
    }
    slug
}

/// Slug derived from a guidebook title, with a short random suffix so
/// non-latin titles still produce distinct slugs.
pub fn slug_from_title(title: &str) -> String {
    let base = sanitize_slug(title);
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..6];
    let max_base = MAX_SLUG_LEN - suffix.len() - 1;
    let base = base[..base.len().min(max_base)].trim_end_matches('-');
    format!("{}-{}", base, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_validate_accepts_simple_slug() {
        assert!(validate_slug("seoul-loft-2").is_ok());
        assert!(validate_slug("abc").is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_slugs() {
        for bad in ["", "ab", "Upper-Case", "has space", "한글슬러그", "under_score"] {
            let err = validate_slug(bad).unwrap_err();
            assert!(!err.is_empty(), "expected error for {:?}", bad);
        }
        assert!(validate_slug(&"a".repeat(51)).is_err());
    }

    #[test]
    fn test_sanitize_examples() {
        assert_eq!(sanitize_slug("My Cozy  Loft!"), "my-cozy-loft");
        assert_eq!(sanitize_slug("--Jeju__House--"), "jeju-house");
        assert_eq!(sanitize_slug("서울"), "guide");
        assert_eq!(sanitize_slug("A"), "a-guide");
    }

    #[test]
    fn test_slug_from_title_is_valid() {
        let slug = slug_from_title("Hanok Stay in Bukchon Village With a Very Long Title Indeed");
        assert!(is_valid_slug(&slug), "{}", slug);
        assert!(is_valid_slug(&slug_from_title("해운대 오션뷰")));
    }

    proptest! {
        #[test]
        fn sanitized_slug_is_always_valid(input in ".{0,200}") {
            let slug = sanitize_slug(&input);
            prop_assert!(SLUG_REGEX.is_match(&slug));
            prop_assert!(slug.len() >= MIN_SLUG_LEN && slug.len() <= MAX_SLUG_LEN);
        }

        #[test]
        fn invalid_slugs_have_messages(input in ".{0,80}") {
            if let Err(message) = validate_slug(&input) {
                prop_assert!(!message.is_empty());
            } else {
                prop_assert!(SLUG_REGEX.is_match(&input));
            }
        }
    }
}
