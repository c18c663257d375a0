/// Maximum stored length of a normalized run key.
pub const RUN_KEY_MAX_LENGTH: usize = 48;

/// Normalizes a caller-provided run key into its stored comparison form.
///
/// Lowercases, collapses whitespace runs into a single `-`, replaces every
/// character outside `[a-z0-9_.-]` with `-`, and clips the result to
/// [`RUN_KEY_MAX_LENGTH`] characters. Normalization is idempotent.
#[must_use]
pub fn normalize_run_key(run_key: &str) -> String {
    let mut normalized = String::with_capacity(run_key.len());
    let mut pending_whitespace = false;

    for character in run_key.trim().to_lowercase().chars() {
        if character.is_whitespace() {
            pending_whitespace = true;
            continue;
        }

        if pending_whitespace {
            normalized.push('-');
            pending_whitespace = false;
        }

        if character.is_ascii_lowercase()
            || character.is_ascii_digit()
            || matches!(character, '_' | '.' | '-')
        {
            normalized.push(character);
        } else {
            normalized.push('-');
        }
    }

    normalized.chars().take(RUN_KEY_MAX_LENGTH).collect()
}

/// Composes a deterministic run key from ordered segments.
///
/// Empty segments are skipped; the joined key is normalized so two callers
/// composing from the same inputs always land on the same stored key.
#[must_use]
pub fn compose_run_key<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = segments
        .into_iter()
        .map(|segment| segment.as_ref().trim().to_owned())
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<String>>()
        .join("--");

    normalize_run_key(joined.as_str())
}

/// Builds a deterministic queue job identifier from ordered segments.
///
/// Segments are joined by `--` with `:` sanitized to `-` so re-enqueueing the
/// same logical job replaces rather than duplicates it.
#[must_use]
pub fn scheduled_job_id<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    segments
        .into_iter()
        .map(|segment| segment.as_ref().trim().replace(':', "-"))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<String>>()
        .join("--")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{RUN_KEY_MAX_LENGTH, compose_run_key, normalize_run_key, scheduled_job_id};

    #[test]
    fn normalization_lowercases_and_replaces_punctuation() {
        assert_eq!(normalize_run_key("Order #42 / Retry"), "order--42---retry");
        assert_eq!(normalize_run_key("daily.load_2024-01-01"), "daily.load_2024-01-01");
    }

    #[test]
    fn normalization_collapses_whitespace_runs() {
        assert_eq!(normalize_run_key("a   b\t\nc"), "a-b-c");
    }

    #[test]
    fn normalization_clips_to_maximum_length() {
        let long = "k".repeat(120);
        assert_eq!(normalize_run_key(long.as_str()).len(), RUN_KEY_MAX_LENGTH);
    }

    #[test]
    fn composed_run_keys_skip_empty_segments() {
        let key = compose_run_key(["asset", "orders", "", "upstream-update", "r1"]);
        assert_eq!(key, "asset--orders--upstream-update--r1");
    }

    #[test]
    fn scheduled_job_ids_sanitize_colons() {
        let job_id = scheduled_job_id(["workflow-retry", "run:1", "step:extract-2"]);
        assert_eq!(job_id, "workflow-retry--run-1--step-extract-2");
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(raw in ".{0,120}") {
            let once = normalize_run_key(raw.as_str());
            prop_assert_eq!(normalize_run_key(once.as_str()), once.clone());
            prop_assert!(once.len() <= RUN_KEY_MAX_LENGTH);
        }

        #[test]
        fn normalization_ignores_case_and_outer_whitespace(raw in "[a-zA-Z0-9_. -]{1,40}") {
            let padded = format!("  {raw}  ");
            prop_assert_eq!(
                normalize_run_key(padded.as_str()),
                normalize_run_key(raw.to_lowercase().as_str())
            );
        }
    }
}
