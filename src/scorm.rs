// Helpers for values reported by SCORM 1.2 packages in interactive modules.

pub fn normalize_lesson_status(v: &str) -> Option<&'static str> {
    match v.trim().to_ascii_lowercase().as_str() {
        "passed"        => Some("passed"),
        "failed"        => Some("failed"),
        "completed"     => Some("completed"),
        "incomplete"    => Some("incomplete"),
        "browsed"       => Some("browsed"),
        "not attempted" => Some("not attempted"),
        _ => None,
    }
}

/// Statuses that mean the learner has gone through all of the content.
pub fn status_means_complete(v: &str) -> bool {
    matches!(normalize_lesson_status(v), Some("completed" | "passed"))
}

/// Slide number from `cmi.core.lesson_location`. Authoring tools write it as
/// `"5"`, `"slide_5"`/`"Slide5"`, `"m1s5"` (module 1, slide 5) or `"frame_5"`.
pub fn parse_slide_location(location: &str) -> Option<i32> {
    let loc = location.trim().to_ascii_lowercase();
    if loc.is_empty() {
        return None;
    }
    let n = if loc.bytes().all(|b| b.is_ascii_digit()) {
        loc.parse().ok()
    } else {
        number_after(&loc, "slide")
            .or_else(|| module_slide(&loc))
            .or_else(|| number_after(&loc, "frame"))
    };
    n.filter(|n| *n > 0)
}

// "<word>" or "<word>_" followed by digits
fn number_after(s: &str, word: &str) -> Option<i32> {
    s.match_indices(word).find_map(|(i, _)| {
        let rest = &s[i + word.len()..];
        let rest = rest.strip_prefix('_').unwrap_or(rest);
        leading_number(rest)
    })
}

// m<digits>s<digits>
fn module_slide(s: &str) -> Option<i32> {
    s.match_indices('m').find_map(|(i, _)| {
        let rest = &s[i + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        rest[digits..].strip_prefix('s').and_then(leading_number)
    })
}

fn leading_number(s: &str) -> Option<i32> {
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    s[..digits].parse().ok()
}
