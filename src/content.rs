use rusqlite::Connection;

pub const ACTIVITY_TYPES: [&str; 5] = ["mcq", "recognition", "listening", "asr", "emotion"];
pub const LAYOUTS: [&str; 6] = ["sound", "image", "sequence", "choose", "asr", "emotion"];

pub fn is_valid_activity_type(value: &str) -> bool {
    ACTIVITY_TYPES.contains(&value)
}

pub fn is_valid_layout(value: &str) -> bool {
    LAYOUTS.contains(&value)
}

/// Expected-answer fields pulled out of an activity's `data` document for
/// one language. Only the fields the activity type actually uses will be
/// present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedBranch {
    pub prompt: Option<String>,
    pub expected_speech: Option<String>,
    pub expected_emotion: Option<String>,
    pub correct_key: Option<String>,
}

/// Resolves the expected-answer fields for `lang` out of an activity `data`
/// document. Content has accumulated two shapes over time: a nested
/// `i18n: {en: {...}, tl: {...}}` branch map, and older flat fields with
/// per-language suffixes (`expected_speech_tl`, `expected_speech_en`) or no
/// suffix at all. Resolution order, per field:
///
/// 1. `i18n[lang]` (or `i18n["en"]` when the language branch is absent),
/// 2. flat `<field>_<lang>`,
/// 3. flat `<field>_en`,
/// 4. flat `<field>`.
pub fn resolve_branch(data: &serde_json::Value, lang: &str) -> ResolvedBranch {
    let branch = pick_branch(data, lang);
    ResolvedBranch {
        prompt: resolve_field(data, branch, lang, &["prompt", "text"]),
        expected_speech: resolve_field(data, branch, lang, &["expected_speech", "expected_text"]),
        expected_emotion: resolve_field(data, branch, lang, &["expected_emotion"]),
        correct_key: resolve_field(data, branch, lang, &["correct_key"]),
    }
}

/// `i18n[lang] or i18n["en"]`. The English branch substitutes for a missing
/// language branch wholesale; it does not backfill individual fields of a
/// present one.
fn pick_branch<'a>(data: &'a serde_json::Value, lang: &str) -> Option<&'a serde_json::Value> {
    let i18n = data.get("i18n")?;
    let by_lang = i18n.get(lang).filter(|v| v.is_object());
    by_lang.or_else(|| i18n.get("en").filter(|v| v.is_object()))
}

fn resolve_field(
    data: &serde_json::Value,
    branch: Option<&serde_json::Value>,
    lang: &str,
    names: &[&str],
) -> Option<String> {
    if let Some(branch) = branch {
        for name in names {
            if let Some(v) = non_empty_str(branch.get(*name)) {
                return Some(v);
            }
        }
    }
    for name in names {
        if let Some(v) = non_empty_str(data.get(format!("{}_{}", name, lang).as_str())) {
            return Some(v);
        }
    }
    for name in names {
        if let Some(v) = non_empty_str(data.get(format!("{}_en", name).as_str())) {
            return Some(v);
        }
    }
    for name in names {
        if let Some(v) = non_empty_str(data.get(*name)) {
            return Some(v);
        }
    }
    None
}

fn non_empty_str(v: Option<&serde_json::Value>) -> Option<String> {
    v.and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Renumbers a lesson's active activities to contiguous 1..N sort keys,
/// keeping their current relative order. Returns how many rows hold a new
/// number. Invariant after any structural change: active activities of a
/// lesson always carry contiguous 1-based sort keys.
pub fn resequence_activities(conn: &Connection, lesson_id: &str) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT id FROM activities
         WHERE lesson_id = ? AND is_active = 1
         ORDER BY sort_order, rowid",
    )?;
    let ids = stmt
        .query_map([lesson_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut moved = 0usize;
    for (i, id) in ids.iter().enumerate() {
        let target = (i + 1) as i64;
        let n = conn.execute(
            "UPDATE activities SET sort_order = ? WHERE id = ? AND sort_order != ?",
            (target, id, target),
        )?;
        moved += n;
    }
    Ok(moved)
}

/// Same compaction for a chapter's active lessons.
pub fn resequence_lessons(conn: &Connection, chapter_id: &str) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT id FROM lessons
         WHERE chapter_id = ? AND is_active = 1
         ORDER BY sort_order, rowid",
    )?;
    let ids = stmt
        .query_map([chapter_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut moved = 0usize;
    for (i, id) in ids.iter().enumerate() {
        let target = (i + 1) as i64;
        let n = conn.execute(
            "UPDATE lessons SET sort_order = ? WHERE id = ? AND sort_order != ?",
            (target, id, target),
        )?;
        moved += n;
    }
    Ok(moved)
}
