//! Fuzzy matching of configured device names against real capture devices.
//!
//! Device names differ between the configuring tool and the audio API in
//! punctuation, case and trailing whitespace ("Microphone (USB Audio CODEC )"
//! vs "microphone usb audio codec"), so both sides are normalized before a
//! normalized edit-distance similarity is compared against a threshold.

use thiserror::Error;

/// Default minimum similarity for a device to match.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.7;

/// No candidate reached the threshold.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("audio device '{name}' not found")]
pub struct DeviceNotFound {
    pub name: String,
}

/// Strips everything outside `[A-Za-z0-9]` and lowercases the rest.
pub fn normalize(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Levenshtein distance over chars.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != *cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Similarity of two names in `[0, 1]`, computed on their normalized forms.
///
/// Two names that both normalize to the empty string are identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);

    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }

    let score = 1.0 - edit_distance(&a, &b) as f64 / longest as f64;
    score.clamp(0.0, 1.0)
}

/// Returns the first candidate, in enumeration order, whose similarity to
/// `target` meets `threshold`.
pub fn resolve_device<'a, I>(target: &str, candidates: I, threshold: f64) -> Result<&'a str, DeviceNotFound>
where
    I: IntoIterator<Item = &'a str>,
{
    for candidate in candidates {
        let score = similarity(candidate, target);
        if score >= threshold {
            tracing::info!(device = candidate, similarity = score, threshold, "Device name matched");
            return Ok(candidate);
        }
        tracing::debug!(device = candidate, similarity = score, threshold, "Device name did not match");
    }

    Err(DeviceNotFound {
        name: target.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("Microphone (USB Audio CODEC )"), "microphoneusbaudiocodec");
        assert_eq!(normalize("  -- "), "");
        assert_eq!(normalize("hw:1,0"), "hw10");
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("abc", ""), 3);
        assert_eq!(edit_distance("same", "same"), 0);
    }

    #[test]
    fn test_similarity_identical_after_normalizing() {
        assert_eq!(
            similarity("Microphone (USB Audio CODEC )", "microphoneusbaudiocodec"),
            1.0
        );
    }

    #[test]
    fn test_similarity_empty() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("()", " "), 1.0);
        assert_eq!(similarity("", "abc"), 0.0);
    }

    #[test]
    fn test_similarity_bounds() {
        let names = ["", "a", "USB Audio", "Line In (Realtek)", "zzzzzzzzzzzz", "Mic 1"];
        for a in names {
            for b in names {
                let s = similarity(a, b);
                assert!((0.0..=1.0).contains(&s), "{a:?} vs {b:?} = {s}");
            }
        }
    }

    #[test]
    fn test_resolve_first_match_in_order() {
        let devices = [
            "Built-in Microphone",
            "Microphone (USB Audio CODEC)",
            "Microphone (USB Audio CODEC) #2",
        ];
        let found = resolve_device("Microphone (USB Audio CODEC )", devices, 0.7).unwrap();
        assert_eq!(found, "Microphone (USB Audio CODEC)");
    }

    #[test]
    fn test_resolve_threshold_is_inclusive() {
        // "abcd" vs "abce": 1 - 1/4 = 0.75
        assert_eq!(resolve_device("abcd", ["abce"], 0.75), Ok("abce"));
        assert!(resolve_device("abcd", ["abce"], 0.76).is_err());
    }

    #[test]
    fn test_resolve_not_found() {
        let err = resolve_device("USB Audio CODEC", ["HDA Intel PCH", "Webcam"], DEFAULT_MATCH_THRESHOLD)
            .unwrap_err();
        assert_eq!(err.to_string(), "audio device 'USB Audio CODEC' not found");
        assert!(resolve_device("anything", Vec::<&str>::new(), 0.0).is_err());
    }
}
