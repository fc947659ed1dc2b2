//! Language detection over accumulated model output, used to pick the
//! continuation prompt. Script-block counting first, then a small diacritic
//! heuristic for Latin-script languages.

use crate::config::RetryPrompts;

/// A script block's share of the text must exceed this to claim the
/// language.
const SCRIPT_THRESHOLD: f64 = 0.10;

const FRENCH_MARKERS: &[char] = &[
    'à', 'â', 'ç', 'è', 'é', 'ê', 'ë', 'î', 'ï', 'ô', 'û', 'ù', 'œ',
];
const GERMAN_MARKERS: &[char] = &['ä', 'ö', 'ü', 'ß'];
const SPANISH_MARKERS: &[char] = &['ñ', '¿', '¡', 'á', 'í', 'ó', 'ú'];

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}')
}

fn is_kana(c: char) -> bool {
    matches!(c, '\u{3040}'..='\u{309F}' | '\u{30A0}'..='\u{30FF}')
}

fn is_hangul(c: char) -> bool {
    matches!(c, '\u{AC00}'..='\u{D7AF}' | '\u{1100}'..='\u{11FF}')
}

fn is_arabic(c: char) -> bool {
    matches!(c, '\u{0600}'..='\u{06FF}')
}

fn is_cyrillic(c: char) -> bool {
    matches!(c, '\u{0400}'..='\u{04FF}')
}

/// Detected language label: one of `zh ja ko ar ru fr de es en`.
pub fn detect_language(text: &str) -> &'static str {
    let total = text.chars().count();
    if total == 0 {
        return "en";
    }

    let mut cjk = 0usize;
    let mut kana = 0usize;
    let mut hangul = 0usize;
    let mut arabic = 0usize;
    let mut cyrillic = 0usize;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else if is_kana(c) {
            kana += 1;
        } else if is_hangul(c) {
            hangul += 1;
        } else if is_arabic(c) {
            arabic += 1;
        } else if is_cyrillic(c) {
            cyrillic += 1;
        }
    }

    let share = |count: usize| count as f64 / total as f64;
    // First matching block wins, in this order.
    for (count, label) in [
        (cjk, "zh"),
        (kana, "ja"),
        (hangul, "ko"),
        (arabic, "ar"),
        (cyrillic, "ru"),
    ] {
        if share(count) > SCRIPT_THRESHOLD {
            return label;
        }
    }

    if text.chars().any(|c| FRENCH_MARKERS.contains(&c)) {
        return "fr";
    }
    if text.chars().any(|c| GERMAN_MARKERS.contains(&c)) {
        return "de";
    }
    if text.chars().any(|c| SPANISH_MARKERS.contains(&c)) {
        return "es";
    }

    "en"
}

const PROMPT_JA: &str =
    "中断したところから正確に続けてください。すでに生成した内容を繰り返さないでください。";
const PROMPT_KO: &str = "중단된 부분부터 정확히 이어서 작성하세요. 이전 내용을 반복하지 마세요.";
const PROMPT_AR: &str = "تابع من حيث توقفت تمامًا دون تكرار أي محتوى سابق.";
const PROMPT_RU: &str =
    "Продолжай ровно с того места, где остановился, не повторяя уже сказанное.";
const PROMPT_FR: &str =
    "Continue exactement là où tu t'es arrêté, sans répéter le contenu déjà produit.";
const PROMPT_DE: &str =
    "Fahre genau dort fort, wo du aufgehört hast, ohne bereits Gesagtes zu wiederholen.";
const PROMPT_ES: &str =
    "Continúa exactamente donde lo dejaste, sin repetir el contenido anterior.";

/// Language-agnostic fallback for labels with no table entry.
const PROMPT_DEFAULT: &str = "Continue from where you stopped.";

/// Continuation instruction for a detected language. English and Chinese
/// come from the configuration snapshot; the rest are built in.
pub fn retry_prompt<'a>(prompts: &'a RetryPrompts, language: &str) -> &'a str {
    match language {
        "en" => &prompts.en,
        "zh" => &prompts.zh,
        "ja" => PROMPT_JA,
        "ko" => PROMPT_KO,
        "ar" => PROMPT_AR,
        "ru" => PROMPT_RU,
        "fr" => PROMPT_FR,
        "de" => PROMPT_DE,
        "es" => PROMPT_ES,
        _ => PROMPT_DEFAULT,
    }
}
